use std::{cmp::Ordering, fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{GatewayError, GatewayResult};

use super::{interface::InterfaceDescriptor, routing::RoutingRule, version::Version};

static MODULE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+-]+$").unwrap());

/// Module id split into product name and version, e.g. `mod-users-1.2.3`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleId {
    product: String,
    version: Option<Version>,
}

impl ModuleId {
    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Signed comparison: ±1 when products differ, otherwise the version
    /// magnitudes of [`Version::compare`] (±2 major, ±3 minor, ±4 patch).
    pub fn compare(&self, other: &ModuleId) -> i32 {
        match self.product.cmp(&other.product) {
            Ordering::Less => return -1,
            Ordering::Greater => return 1,
            Ordering::Equal => {}
        }
        match (&self.version, &other.version) {
            (Some(a), Some(b)) => a.compare(b),
            (None, None) => 0,
            (None, Some(_)) => -2,
            (Some(_), None) => 2,
        }
    }
}

impl FromStr for ModuleId {
    type Err = GatewayError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        if !MODULE_ID_RE.is_match(id) {
            return Err(GatewayError::User(format!("Invalid module id: {id}")));
        }

        // the version starts at the first '-' followed by a parseable version
        for (idx, _) in id.match_indices('-') {
            let rest = &id[idx + 1..];
            if !rest.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(version) = rest.parse::<Version>() {
                if idx == 0 {
                    break;
                }
                return Ok(Self {
                    product: id[..idx].to_string(),
                    version: Some(version),
                });
            }
        }

        Ok(Self {
            product: id.to_string(),
            version: None,
        })
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}-{}", self.product, version),
            None => write!(f, "{}", self.product),
        }
    }
}

/// Module descriptor: what a module provides, requires and filters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "ModuleDescriptor::validate_provides"))]
pub struct ModuleDescriptor {
    #[validate(custom(function = "ModuleDescriptor::validate_id"))]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub provides: Vec<InterfaceDescriptor>,
    #[serde(default)]
    pub requires: Vec<InterfaceDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<RoutingRule>,
}

impl ModuleDescriptor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            provides: Vec::new(),
            requires: Vec::new(),
            filters: Vec::new(),
        }
    }

    fn validate_id(id: &str) -> Result<(), ValidationError> {
        if id.parse::<ModuleId>().is_err() {
            let mut err = ValidationError::new("invalid_module_id");
            err.add_param("id".into(), &id.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn validate_provides(&self) -> Result<(), ValidationError> {
        for iface in &self.provides {
            if iface.id.is_empty() {
                return Err(ValidationError::new("interface_id_required"));
            }
            if iface.version.single().is_none() {
                let mut err = ValidationError::new("provided_interface_single_version");
                err.add_param("interface".into(), &iface.id);
                return Err(err);
            }
        }
        if self.requires.iter().any(|iface| iface.id.is_empty()) {
            return Err(ValidationError::new("interface_id_required"));
        }
        Ok(())
    }

    /// Validation for descriptors supplied by callers.
    pub fn check(&self) -> GatewayResult<()> {
        self.validate()
            .map_err(|e| GatewayError::User(format!("Invalid module {}: {e}", self.id)))
    }

    pub fn module_id(&self) -> GatewayResult<ModuleId> {
        self.id.parse()
    }

    pub fn product(&self) -> String {
        self.module_id()
            .map(|mid| mid.product().to_string())
            .unwrap_or_else(|_| self.id.clone())
    }

    pub fn provided(&self, interface_id: &str) -> Option<&InterfaceDescriptor> {
        self.provides.iter().find(|iface| iface.id == interface_id)
    }

    /// Compares by product, then version. See [`ModuleId::compare`].
    pub fn compare(&self, other: &ModuleDescriptor) -> i32 {
        match (self.module_id(), other.module_id()) {
            (Ok(a), Ok(b)) => a.compare(&b),
            _ => match self.id.cmp(&other.id) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            },
        }
    }
}
