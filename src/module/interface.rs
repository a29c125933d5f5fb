use serde::{Deserialize, Serialize};

use super::{routing::RoutingRule, version::VersionRange};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    #[default]
    Proxy,
    System,
    /// May be provided by more than one enabled module at a time.
    Multiple,
}

/// A capability a module provides or requires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDescriptor {
    pub id: String,
    pub version: VersionRange,
    #[serde(default)]
    pub interface_type: InterfaceType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<RoutingRule>,
}

impl InterfaceDescriptor {
    pub fn new(id: &str, version: VersionRange) -> Self {
        Self {
            id: id.to_string(),
            version,
            interface_type: InterfaceType::default(),
            handlers: Vec::new(),
        }
    }

    /// Whether this provided interface satisfies `required`.
    pub fn is_compatible(&self, required: &InterfaceDescriptor) -> bool {
        is_compatible(self, required)
    }
}

/// Interface ids must be equal and one of the required alternatives must be met
/// by the provided version.
pub fn is_compatible(provided: &InterfaceDescriptor, required: &InterfaceDescriptor) -> bool {
    if provided.id != required.id {
        return false;
    }
    provided
        .version
        .alternatives()
        .iter()
        .any(|version| required.version.is_satisfied_by(version))
}
