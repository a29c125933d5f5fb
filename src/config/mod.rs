use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace, LevelFilter};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{module::ModuleDescriptor, pipeline::ResolverOptions};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_tenant_modules"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[serde(default)]
    #[validate(nested)]
    pub admin: Admin,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub prometheus: Option<Prometheus>,

    #[serde(default)]
    #[validate(nested)]
    pub gateway: Gateway,
    #[serde(default)]
    #[validate(nested)]
    pub cluster: Cluster,
    #[serde(default)]
    #[validate(nested)]
    pub deploy: Deploy,
    #[serde(default)]
    pub log: Option<Log>,

    #[serde(default)]
    #[validate(nested)]
    pub modules: Vec<ModuleDescriptor>,
    #[serde(default)]
    #[validate(nested)]
    pub tenants: Vec<TenantConfig>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    /// Module ids and tenant ids are unique, and tenants only enable known modules.
    fn validate_tenant_modules(&self) -> Result<(), ValidationError> {
        let mut module_ids = HashSet::new();
        for module in &self.modules {
            if !module_ids.insert(module.id.as_str()) {
                let mut err = ValidationError::new("duplicate_module_id");
                err.add_param("id".into(), &module.id);
                return Err(err);
            }
        }

        let mut tenant_ids = HashSet::new();
        for tenant in &self.tenants {
            if !tenant_ids.insert(tenant.id.as_str()) {
                let mut err = ValidationError::new("duplicate_tenant_id");
                err.add_param("id".into(), &tenant.id);
                return Err(err);
            }
            for module in &tenant.modules {
                if !module_ids.contains(module.as_str()) {
                    let mut err = ValidationError::new("unknown_enabled_module");
                    err.add_param("tenant".into(), &tenant.id);
                    err.add_param("module".into(), module);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    #[validate(length(min = 1))]
    pub api_key: Option<String>,
}

impl Default for Admin {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 9180)),
            api_key: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

/// Log file of the gateway, written by the log service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    /// Level filter such as `info` or `debug`; `RUST_LOG` still overrides it per target.
    #[serde(default = "Log::default_level")]
    pub level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

/// Request handling knobs.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Gateway {
    #[serde(default = "Gateway::default_tenant_header")]
    #[validate(length(min = 1))]
    pub tenant_header: String,
    #[serde(default = "Gateway::default_permissions_header")]
    #[validate(length(min = 1))]
    pub permissions_header: String,
    #[serde(default = "Gateway::default_stop_header")]
    #[validate(length(min = 1))]
    pub stop_header: String,
    #[serde(default = "Gateway::default_max_redirects")]
    #[validate(range(max = 64))]
    pub max_redirects: usize,
    #[serde(default = "Gateway::default_pipeline_cache_capacity")]
    pub pipeline_cache_capacity: usize,
    /// Seconds a resolved pipeline stays cached.
    #[serde(default = "Gateway::default_pipeline_cache_ttl")]
    pub pipeline_cache_ttl: u64,
}

impl Gateway {
    fn default_tenant_header() -> String {
        "x-gateway-tenant".to_string()
    }

    fn default_permissions_header() -> String {
        "x-gateway-module-permissions".to_string()
    }

    fn default_stop_header() -> String {
        "x-gateway-stop".to_string()
    }

    fn default_max_redirects() -> usize {
        5
    }

    fn default_pipeline_cache_capacity() -> usize {
        1024
    }

    fn default_pipeline_cache_ttl() -> u64 {
        60
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            max_redirects: self.max_redirects,
            permissions_header: self.permissions_header.clone(),
        }
    }

    pub fn pipeline_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline_cache_ttl)
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            tenant_header: Self::default_tenant_header(),
            permissions_header: Self::default_permissions_header(),
            stop_header: Self::default_stop_header(),
            max_redirects: Self::default_max_redirects(),
            pipeline_cache_capacity: Self::default_pipeline_cache_capacity(),
            pipeline_cache_ttl: Self::default_pipeline_cache_ttl(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Cluster {
    #[serde(default = "Cluster::default_node_id")]
    #[validate(length(min = 1))]
    pub node_id: String,
    #[validate(nested)]
    pub etcd: Option<Etcd>,
    #[serde(default)]
    #[validate(nested)]
    pub locked_map: RetryPolicy,
    /// Seconds a node stays registered in etcd without renewing its lease.
    #[serde(default = "Cluster::default_node_ttl")]
    #[validate(range(min = 2))]
    pub node_ttl: i64,
    /// Seconds between refreshes of modules and deployments.
    #[serde(default = "Cluster::default_maintenance_interval")]
    #[validate(range(min = 1))]
    pub maintenance_interval: u64,
}

impl Cluster {
    fn default_node_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn default_node_ttl() -> i64 {
        10
    }

    fn default_maintenance_interval() -> u64 {
        30
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval)
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            node_id: Self::default_node_id(),
            etcd: None,
            locked_map: RetryPolicy::default(),
            node_ttl: Self::default_node_ttl(),
            maintenance_interval: Self::default_maintenance_interval(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[validate(length(min = 1))]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Compare-and-swap retry policy of the locked maps.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// Fixed delay before a retry, in milliseconds.
    #[serde(default = "RetryPolicy::default_delay")]
    pub delay: u64,
    /// Upper bound of the random extra delay, in milliseconds.
    #[serde(default = "RetryPolicy::default_jitter")]
    pub jitter: u64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        100
    }

    fn default_delay() -> u64 {
        10
    }

    fn default_jitter() -> u64 {
        10
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            delay: Self::default_delay(),
            jitter: Self::default_jitter(),
        }
    }
}

/// Liveness polling of freshly started module processes.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Deploy::validate_backoff"))]
pub struct Deploy {
    #[serde(default = "Deploy::default_liveness_retries")]
    #[validate(range(min = 1))]
    pub liveness_retries: u32,
    /// Initial backoff in milliseconds, doubled after each failed probe.
    #[serde(default = "Deploy::default_liveness_backoff")]
    pub liveness_backoff: u64,
    #[serde(default = "Deploy::default_liveness_backoff_max")]
    pub liveness_backoff_max: u64,
}

impl Deploy {
    fn default_liveness_retries() -> u32 {
        10
    }

    fn default_liveness_backoff() -> u64 {
        100
    }

    fn default_liveness_backoff_max() -> u64 {
        5000
    }

    fn validate_backoff(&self) -> Result<(), ValidationError> {
        if self.liveness_backoff > self.liveness_backoff_max {
            return Err(ValidationError::new("liveness_backoff_exceeds_max"));
        }
        Ok(())
    }
}

impl Default for Deploy {
    fn default() -> Self {
        Self {
            liveness_retries: Self::default_liveness_retries(),
            liveness_backoff: Self::default_liveness_backoff(),
            liveness_backoff_max: Self::default_liveness_backoff_max(),
        }
    }
}

/// Tenant provisioned at startup.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct TenantConfig {
    #[validate(length(min = 1))]
    pub id: String,
    pub description: Option<String>,
    /// Module ids enabled for the tenant, in order.
    #[serde(default)]
    pub modules: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn not_a_test_i_cannot_write_yaml_by_hand() {
        init_log();
        let conf = Config::default();
        // cargo test -- --nocapture not_a_test_i_cannot_write_yaml_by_hand
        println!("{}", conf.to_yaml());
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
pingora:
  version: 1
  client_bind_to_ipv4:
      - 1.2.3.4
      - 5.6.7.8
  client_bind_to_ipv6: []

admin:
  address: 0.0.0.0:9180
  api_key: secret

prometheus:
  address: 0.0.0.0:9091

log:
  path: /var/log/modgate/gateway.log
  level: debug

gateway:
  tenant_header: x-tenant
  max_redirects: 3

cluster:
  node_id: node-a
  node_ttl: 6
  etcd:
    host:
      - http://127.0.0.1:2379
    prefix: /modgate
  locked_map:
    max_attempts: 10

modules:
  - id: mod-users-1.0.0
    provides:
      - id: users
        version: "1.2"
        handlers:
          - methods: [GET]
            pathPattern: /users/{id}
            level: "30"
  - id: mod-auth-1.0.0
    filters:
      - methods: ["*"]
        pathPattern: /*
        level: 10

tenants:
  - id: diku
    modules:
      - mod-auth-1.0.0
      - mod-users-1.0.0
        "#
        .to_string();
        let conf = Config::from_yaml(&conf_str).unwrap();
        assert_eq!(2, conf.pingora.client_bind_to_ipv4.len());
        assert_eq!(1, conf.pingora.version);
        assert_eq!(Some("secret".to_string()), conf.admin.api_key);
        assert_eq!(9091, conf.prometheus.as_ref().unwrap().address.port());
        assert_eq!("x-tenant", conf.gateway.tenant_header);
        assert_eq!("x-gateway-stop", conf.gateway.stop_header);
        assert_eq!(3, conf.gateway.resolver_options().max_redirects);
        assert_eq!("node-a", conf.cluster.node_id);
        assert_eq!(6, conf.cluster.node_ttl);
        assert_eq!(LevelFilter::Debug, conf.log.as_ref().unwrap().level_filter());
        assert_eq!(10, conf.cluster.locked_map.max_attempts);
        assert_eq!(10, conf.cluster.locked_map.delay);
        assert_eq!("/modgate", conf.cluster.etcd.as_ref().unwrap().prefix);
        assert_eq!(2, conf.modules.len());
        assert_eq!(30, conf.modules[0].provides[0].handlers[0].level());
        assert_eq!(1, conf.tenants.len());
        print!("{}", conf.to_yaml());
    }

    #[test]
    fn test_defaults() {
        init_log();
        let conf = Config::from_yaml("---\npingora:\n  version: 1\n").unwrap();
        assert_eq!(9180, conf.admin.address.port());
        assert!(conf.status.is_none());
        assert!(conf.prometheus.is_none());
        assert!(conf.log.is_none());
        assert!(conf.cluster.etcd.is_none());
        assert!(!conf.cluster.node_id.is_empty());
        assert_eq!(10, conf.cluster.node_ttl);
        assert_eq!(Duration::from_secs(30), conf.cluster.maintenance_interval());
        assert_eq!(10, conf.deploy.liveness_retries);
        assert_eq!(
            Duration::from_secs(60),
            conf.gateway.pipeline_cache_ttl()
        );
    }

    #[test]
    fn test_valid_tenant_unknown_module() {
        init_log();
        let conf_str = r#"
---
modules:
  - id: mod-users-1.0.0

tenants:
  - id: diku
    modules:
      - mod-orders-1.0.0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_duplicate_ids() {
        init_log();
        let conf_str = r#"
---
modules:
  - id: mod-users-1.0.0
  - id: mod-users-1.0.0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
tenants:
  - id: diku
  - id: diku
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_module_descriptor() {
        init_log();
        // provided interfaces carry a single version
        let conf_str = r#"
---
modules:
  - id: mod-users-1.0.0
    provides:
      - id: users
        version: "1.0 2.0"
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        // bad pattern is rejected while decoding
        let conf_str = r#"
---
modules:
  - id: mod-users-1.0.0
    filters:
      - pathPattern: /users/{id
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_valid_retry_and_deploy() {
        init_log();
        let conf_str = r#"
---
cluster:
  locked_map:
    max_attempts: 0
        "#;
        assert!(Config::from_yaml(conf_str).is_err());

        let conf_str = r#"
---
deploy:
  liveness_backoff: 1000
  liveness_backoff_max: 10
        "#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
