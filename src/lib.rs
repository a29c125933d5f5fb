//! A multi-tenant module gateway.
//!
//! Modules describe the interfaces they provide along with routing rules;
//! tenants enable modules, and each request is resolved into an ordered
//! pipeline of filter and handler invocations.

pub mod admin;
pub mod cluster;
pub mod config;
pub mod core;
pub mod deploy;
pub mod logging;
pub mod manager;
pub mod module;
pub mod pipeline;
pub mod proxy;
pub mod service;
pub(crate) mod utils;
