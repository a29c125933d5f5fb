//! Error types and process-wide readiness state.

pub mod error;
pub mod status;

pub use error::{ErrorContext, ErrorKind, GatewayError, GatewayResult};
