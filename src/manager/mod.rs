//! Authoritative views of modules and tenants.

pub mod module;
pub mod store;
pub mod tenant;

pub use module::ModuleManager;
pub use store::{DescriptorStore, MemoryStore};
pub use tenant::{Tenant, TenantManager};
