pub mod bootstrap;
pub mod maintenance;
pub mod status;
