//! Module model: versions, interfaces, routing rules and descriptors.

pub mod descriptor;
pub mod interface;
pub mod routing;
pub mod version;

pub use descriptor::{ModuleDescriptor, ModuleId};
pub use interface::{is_compatible, InterfaceDescriptor, InterfaceType};
pub use routing::{PathPattern, PathSpec, RoutingRule, RoutingRuleConfig, RuleType};
pub use version::{compare_versions, Version, VersionRange};
