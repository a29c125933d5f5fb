use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    cluster::{LockedMap, ReloadHandler, ReloadPublisher, ReloadSignal, ReloadTracker},
    core::{GatewayError, GatewayResult},
    module::{InterfaceType, ModuleDescriptor, ModuleId},
};

use super::{module::ModuleManager, store::DescriptorStore};

static TENANT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    #[validate(regex(path = *TENANT_ID_RE))]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Enabled module ids, in enablement order.
    #[serde(default)]
    pub enabled_modules: Vec<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Tenant {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            description: None,
            enabled_modules: Vec::new(),
            timestamp: 0,
        }
    }

    pub fn is_enabled(&self, module_id: &str) -> bool {
        self.enabled_modules.iter().any(|id| id == module_id)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Owns the tenants and the modules enabled for each of them.
///
/// Writes run as read-modify-write cycles on the cluster registry, so every
/// change applies to the latest tenant whichever node made the last one.
pub struct TenantManager {
    store: Arc<dyn DescriptorStore<Tenant>>,
    registry: LockedMap<Tenant>,
    modules: Arc<ModuleManager>,
    publisher: Arc<dyn ReloadPublisher>,
    tenants: DashMap<String, Arc<Tenant>>,
    tracker: ReloadTracker,
}

impl TenantManager {
    pub fn new(
        store: Arc<dyn DescriptorStore<Tenant>>,
        registry: LockedMap<Tenant>,
        modules: Arc<ModuleManager>,
        publisher: Arc<dyn ReloadPublisher>,
    ) -> Self {
        Self {
            store,
            registry,
            modules,
            publisher,
            tenants: DashMap::new(),
            tracker: ReloadTracker::new(),
        }
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub async fn create(&self, mut tenant: Tenant) -> GatewayResult<Arc<Tenant>> {
        tenant
            .validate()
            .map_err(|e| GatewayError::User(format!("Invalid tenant {}: {e}", tenant.id)))?;

        if self.tenants.contains_key(&tenant.id) {
            return Err(GatewayError::User(format!("Tenant {} already exists", tenant.id)));
        }

        let requested = std::mem::take(&mut tenant.enabled_modules);
        for module_id in requested {
            let md = self.modules.lookup(&module_id).await?;
            Self::apply_enable(&mut tenant, &md, &self.modules)?;
        }
        tenant.timestamp = now_millis();

        self.registry.add(&tenant.id, &tenant.id, &tenant).await?;
        if let Err(e) = self.store.insert(&tenant.id, &tenant).await {
            if let Err(undo) = self.registry.remove(&tenant.id, &tenant.id).await {
                log::error!("Failed to undo creation of tenant {}: {undo}", tenant.id);
            }
            return Err(e);
        }

        log::info!("Tenant {} created", tenant.id);
        Ok(self.publish(tenant).await)
    }

    /// Creates `tenant` unless the cluster registry knows it already.
    pub async fn ensure(&self, tenant: Tenant) -> GatewayResult<Arc<Tenant>> {
        match self.registry.get(&tenant.id, &tenant.id).await {
            Ok(existing) => {
                self.load_modules(&existing).await?;
                let existing = Arc::new(existing);
                self.tracker.mark(&existing.id, existing.timestamp);
                self.tenants.insert(existing.id.clone(), existing.clone());
                Ok(existing)
            }
            Err(e) if e.is_not_found() => self.create(tenant).await,
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: &str) -> GatewayResult<Arc<Tenant>> {
        self.tenants
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("Tenant {id} not found")))
    }

    /// Every tenant, ordered by id.
    pub fn list(&self) -> Vec<Arc<Tenant>> {
        let mut tenants: Vec<_> = self.tenants.iter().map(|t| t.value().clone()).collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    pub async fn delete(&self, id: &str) -> GatewayResult<()> {
        let tenant = self.load(id).await?;

        match self.registry.remove(id, id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.store.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.tenants.remove(id);

        let timestamp = (tenant.timestamp + 1).max(now_millis());
        self.tracker.mark(id, timestamp);
        self.send_signal(id, timestamp).await;
        log::info!("Tenant {id} deleted");
        Ok(())
    }

    /// Enables a module, given by id or by product name (latest version).
    pub async fn enable(&self, tenant_id: &str, module_id: &str) -> GatewayResult<Arc<Tenant>> {
        let md = self.modules.lookup(module_id).await?;
        self.load(tenant_id).await?;

        let modules = &self.modules;
        let mut replaced = None;
        let tenant = loop {
            // modules enabled by other nodes must be known for the interface checks
            let mut unknown = Vec::new();
            let res = self
                .update(tenant_id, |tenant| {
                    unknown = tenant
                        .enabled_modules
                        .iter()
                        .filter(|id| !modules.contains(id))
                        .cloned()
                        .collect();
                    if !unknown.is_empty() {
                        return Err(GatewayError::Internal(format!(
                            "Modules of tenant {tenant_id} not loaded"
                        )));
                    }
                    replaced = Self::apply_enable(tenant, &md, modules)?;
                    Ok(())
                })
                .await;
            if unknown.is_empty() {
                break res?;
            }
            self.modules.fetch_many(&unknown).await?;
        };

        // the module may have been deleted since it was looked up
        if !self.modules.is_registered(&md.id).await? {
            log::warn!(
                "Module {} vanished while enabling it for tenant {tenant_id}",
                md.id
            );
            self.update(tenant_id, |tenant| {
                if let Some(pos) = tenant.enabled_modules.iter().position(|id| *id == md.id) {
                    match &replaced {
                        Some(previous) => tenant.enabled_modules[pos] = previous.clone(),
                        None => {
                            tenant.enabled_modules.remove(pos);
                        }
                    }
                }
                Ok(())
            })
            .await?;
            return Err(GatewayError::NotFound(format!("Module {} not found", md.id)));
        }

        log::info!("Module {} enabled for tenant {}", md.id, tenant_id);
        Ok(tenant)
    }

    /// Disables a module, given by id or by product name.
    pub async fn disable(&self, tenant_id: &str, module_id: &str) -> GatewayResult<Arc<Tenant>> {
        self.load(tenant_id).await?;

        let mut removed = String::new();
        let tenant = self
            .update(tenant_id, |tenant| {
                let pos = tenant
                    .enabled_modules
                    .iter()
                    .position(|id| id == module_id)
                    .or_else(|| {
                        tenant.enabled_modules.iter().position(|id| {
                            id.parse::<ModuleId>()
                                .map_or(false, |mid| mid.product() == module_id)
                        })
                    })
                    .ok_or_else(|| {
                        GatewayError::NotFound(format!(
                            "Module {module_id} is not enabled for tenant {tenant_id}"
                        ))
                    })?;
                removed = tenant.enabled_modules.remove(pos);
                Ok(())
            })
            .await?;

        log::info!("Module {} disabled for tenant {}", removed, tenant_id);
        Ok(tenant)
    }

    /// Modules enabled for `tenant_id`, in enablement order.
    pub fn enabled_modules(&self, tenant_id: &str) -> GatewayResult<Vec<Arc<ModuleDescriptor>>> {
        let tenant = self.get(tenant_id)?;
        self.modules.get_many(&tenant.enabled_modules)
    }

    /// Whether any tenant of the cluster has `module_id` enabled.
    pub async fn is_module_in_use(&self, module_id: &str) -> GatewayResult<bool> {
        Ok(self
            .registry_tenants()
            .await?
            .iter()
            .any(|t| t.is_enabled(module_id)))
    }

    /// Rebuilds the local view from the cluster registry.
    pub async fn reload(&self) -> GatewayResult<usize> {
        let fresh = self.registry_tenants().await?;
        for tenant in &fresh {
            self.load_modules(tenant).await?;
        }

        self.tenants.clear();
        for tenant in fresh {
            self.tracker.mark(&tenant.id, tenant.timestamp);
            self.tenants.insert(tenant.id.clone(), Arc::new(tenant));
        }
        Ok(self.tenants.len())
    }

    async fn registry_tenants(&self) -> GatewayResult<Vec<Tenant>> {
        let mut tenants = Vec::new();
        for id in self.registry.get_keys().await? {
            match self.registry.get(&id, &id).await {
                Ok(tenant) => tenants.push(tenant),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tenants)
    }

    /// The tenant as currently stored in the cluster registry.
    async fn load(&self, id: &str) -> GatewayResult<Tenant> {
        self.registry.get(id, id).await.map_err(|e| {
            if e.is_not_found() {
                GatewayError::NotFound(format!("Tenant {id} not found"))
            } else {
                e
            }
        })
    }

    /// Makes the tenant's modules known locally, including those another
    /// node registered.
    async fn load_modules(&self, tenant: &Tenant) -> GatewayResult<()> {
        for module_id in &tenant.enabled_modules {
            match self.modules.fetch(module_id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    log::warn!("Tenant {} enables unknown module {module_id}", tenant.id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Adds `md` to the tenant, upgrading in place when another version of
    /// the same product is enabled. Returns the id of the replaced version.
    fn apply_enable(
        tenant: &mut Tenant,
        md: &ModuleDescriptor,
        modules: &ModuleManager,
    ) -> GatewayResult<Option<String>> {
        if tenant.is_enabled(&md.id) {
            return Err(GatewayError::User(format!(
                "Module {} is already enabled for tenant {}",
                md.id, tenant.id
            )));
        }

        let product = md.product();
        let replaced = tenant.enabled_modules.iter().position(|id| {
            id.parse::<ModuleId>()
                .map_or(false, |mid| mid.product() == product)
        });

        for (pos, other_id) in tenant.enabled_modules.iter().enumerate() {
            if Some(pos) == replaced {
                continue;
            }
            let other = modules.get(other_id)?;
            for iface in &md.provides {
                if iface.interface_type == InterfaceType::Multiple {
                    continue;
                }
                let clash = other.provides.iter().any(|o| {
                    o.id == iface.id && o.interface_type != InterfaceType::Multiple
                });
                if clash {
                    return Err(GatewayError::User(format!(
                        "Interface {} of {} is already provided by {}",
                        iface.id, md.id, other.id
                    )));
                }
            }
        }

        match replaced {
            Some(pos) => {
                log::info!(
                    "Replacing {} with {} for tenant {}",
                    tenant.enabled_modules[pos],
                    md.id,
                    tenant.id
                );
                let previous = std::mem::replace(&mut tenant.enabled_modules[pos], md.id.clone());
                Ok(Some(previous))
            }
            None => {
                tenant.enabled_modules.push(md.id.clone());
                Ok(None)
            }
        }
    }

    /// Applies `f` to the registry copy of the tenant, bumps its timestamp,
    /// then persists and publishes the result.
    async fn update<F>(&self, tenant_id: &str, mut f: F) -> GatewayResult<Arc<Tenant>>
    where
        F: FnMut(&mut Tenant) -> GatewayResult<()> + Send,
    {
        let tenant = self
            .registry
            .update(tenant_id, tenant_id, |tenant| {
                f(tenant)?;
                tenant.timestamp = (tenant.timestamp + 1).max(now_millis());
                Ok(())
            })
            .await?;

        match self.store.update(&tenant.id, &tenant).await {
            // created on another node
            Err(e) if e.is_not_found() => self.store.insert(&tenant.id, &tenant).await?,
            res => res?,
        }
        Ok(self.publish(tenant).await)
    }

    async fn publish(&self, tenant: Tenant) -> Arc<Tenant> {
        let tenant = Arc::new(tenant);
        self.tenants.insert(tenant.id.clone(), tenant.clone());
        self.tracker.mark(&tenant.id, tenant.timestamp);
        self.send_signal(&tenant.id, tenant.timestamp).await;
        tenant
    }

    async fn send_signal(&self, tenant: &str, timestamp: u64) {
        let signal = ReloadSignal {
            tenant: tenant.to_string(),
            timestamp,
        };
        if let Err(e) = self.publisher.publish(signal).await {
            log::warn!("Failed to publish reload of tenant {tenant}: {e}");
        }
    }
}

#[async_trait]
impl ReloadHandler for TenantManager {
    async fn apply_reload(&self, signal: &ReloadSignal) -> GatewayResult<bool> {
        if !self.tracker.is_newer(signal) {
            return Ok(false);
        }

        match self.registry.get(&signal.tenant, &signal.tenant).await {
            Ok(tenant) => {
                log::debug!(
                    "Reloading tenant {} at timestamp {}",
                    tenant.id,
                    tenant.timestamp
                );
                self.load_modules(&tenant).await?;
                self.tracker
                    .mark(&tenant.id, tenant.timestamp.max(signal.timestamp));
                self.tenants.insert(tenant.id.clone(), Arc::new(tenant));
            }
            Err(e) if e.is_not_found() => {
                log::info!("Tenant {} removed by another node", signal.tenant);
                self.tracker.mark(&signal.tenant, signal.timestamp);
                self.tenants.remove(&signal.tenant);
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{LocalSharedMap, ReloadBus, SharedMap},
        config::RetryPolicy,
        manager::store::MemoryStore,
        module::InterfaceDescriptor,
    };

    struct Node {
        modules: Arc<ModuleManager>,
        tenants: TenantManager,
    }

    fn node(shared: Arc<dyn SharedMap>, bus: Arc<ReloadBus>) -> Node {
        let modules = Arc::new(ModuleManager::new(
            Arc::new(MemoryStore::new()),
            LockedMap::new("modules", shared.clone(), RetryPolicy::default()),
        ));
        let tenants = TenantManager::new(
            Arc::new(MemoryStore::new()),
            LockedMap::new("tenants", shared, RetryPolicy::default()),
            modules.clone(),
            bus,
        );
        Node { modules, tenants }
    }

    fn provider(id: &str, iface: &str, interface_type: InterfaceType) -> ModuleDescriptor {
        let mut md = ModuleDescriptor::new(id);
        let mut provided = InterfaceDescriptor::new(iface, "1.0".parse().unwrap());
        provided.interface_type = interface_type;
        md.provides.push(provided);
        md
    }

    async fn setup() -> Node {
        let n = node(Arc::new(LocalSharedMap::new()), Arc::new(ReloadBus::default()));
        for md in [
            provider("mod-a-1.0.0", "x", InterfaceType::Proxy),
            provider("mod-a-1.1.0", "x", InterfaceType::Proxy),
            provider("mod-b-1.0.0", "x", InterfaceType::Proxy),
            provider("mod-c-1.0.0", "m", InterfaceType::Multiple),
            provider("mod-d-1.0.0", "m", InterfaceType::Multiple),
        ] {
            n.modules.create(md).await.unwrap();
        }
        n.tenants.create(Tenant::new("diku")).await.unwrap();
        n
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let n = setup().await;
        let err = n.tenants.create(Tenant::new("diku")).await.unwrap_err();
        assert!(matches!(err, GatewayError::User(_)));
        assert!(n.tenants.create(Tenant::new("bad id")).await.is_err());

        let mut tenant = Tenant::new("other");
        tenant.enabled_modules = vec!["mod-a".to_string(), "mod-c-1.0.0".to_string()];
        let tenant = n.tenants.create(tenant).await.unwrap();
        assert_eq!(tenant.enabled_modules, ["mod-a-1.1.0", "mod-c-1.0.0"]);

        let ids: Vec<_> = n.tenants.list().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, ["diku", "other"]);

        n.tenants.delete("other").await.unwrap();
        assert!(n.tenants.get("other").unwrap_err().is_not_found());
        assert!(n.tenants.delete("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_enable_rules() {
        let n = setup().await;

        let t0 = n.tenants.get("diku").unwrap().timestamp;
        let t1 = n.tenants.enable("diku", "mod-a-1.0.0").await.unwrap();
        assert!(t1.timestamp > t0);
        assert!(n.tenants.is_module_in_use("mod-a-1.0.0").await.unwrap());

        // already enabled
        let err = n.tenants.enable("diku", "mod-a-1.0.0").await.unwrap_err();
        assert!(matches!(err, GatewayError::User(_)));

        // unknown module and tenant
        assert!(n.tenants.enable("diku", "mod-z-1.0.0").await.unwrap_err().is_not_found());
        assert!(n.tenants.enable("nobody", "mod-a-1.0.0").await.unwrap_err().is_not_found());

        // x is a proxy interface already provided by mod-a
        let err = n.tenants.enable("diku", "mod-b-1.0.0").await.unwrap_err();
        assert!(matches!(err, GatewayError::User(_)));

        // multiple interfaces may be provided twice
        n.tenants.enable("diku", "mod-c-1.0.0").await.unwrap();
        n.tenants.enable("diku", "mod-d-1.0.0").await.unwrap();

        // upgrade in place keeps the position
        let t2 = n.tenants.enable("diku", "mod-a-1.1.0").await.unwrap();
        assert_eq!(
            t2.enabled_modules,
            ["mod-a-1.1.0", "mod-c-1.0.0", "mod-d-1.0.0"]
        );
        assert!(t2.timestamp > t1.timestamp);
        assert!(!n.tenants.is_module_in_use("mod-a-1.0.0").await.unwrap());

        let enabled: Vec<_> = n
            .tenants
            .enabled_modules("diku")
            .unwrap()
            .iter()
            .map(|md| md.id.clone())
            .collect();
        assert_eq!(enabled, t2.enabled_modules);
    }

    #[tokio::test]
    async fn test_disable() {
        let n = setup().await;
        n.tenants.enable("diku", "mod-a-1.0.0").await.unwrap();
        n.tenants.enable("diku", "mod-c-1.0.0").await.unwrap();

        let t = n.tenants.disable("diku", "mod-a").await.unwrap();
        assert_eq!(t.enabled_modules, ["mod-c-1.0.0"]);

        let err = n.tenants.disable("diku", "mod-a-1.0.0").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reload_between_nodes() {
        let shared: Arc<dyn SharedMap> = Arc::new(LocalSharedMap::new());
        let bus = Arc::new(ReloadBus::default());
        let n1 = node(shared.clone(), bus.clone());
        let n2 = node(shared, Arc::new(ReloadBus::default()));
        let mut signals = bus.subscribe();

        n1.modules
            .create(provider("mod-a-1.0.0", "x", InterfaceType::Proxy))
            .await
            .unwrap();
        n2.modules.reload().await.unwrap();

        n1.tenants.create(Tenant::new("diku")).await.unwrap();
        let created = signals.recv().await.unwrap();
        assert!(n2.tenants.apply_reload(&created).await.unwrap());
        assert!(n2.tenants.get("diku").unwrap().enabled_modules.is_empty());

        n1.tenants.enable("diku", "mod-a-1.0.0").await.unwrap();
        let enabled = signals.recv().await.unwrap();
        assert!(n2.tenants.apply_reload(&enabled).await.unwrap());
        assert_eq!(
            n2.tenants.get("diku").unwrap().enabled_modules,
            ["mod-a-1.0.0"]
        );

        // stale and duplicate signals are ignored
        assert!(!n2.tenants.apply_reload(&created).await.unwrap());
        assert!(!n2.tenants.apply_reload(&enabled).await.unwrap());

        // the writer ignores its own signal
        assert!(!n1.tenants.apply_reload(&enabled).await.unwrap());

        n1.tenants.delete("diku").await.unwrap();
        let deleted = signals.recv().await.unwrap();
        assert!(n2.tenants.apply_reload(&deleted).await.unwrap());
        assert!(n2.tenants.get("diku").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_node_keeps_other_writes() {
        let shared: Arc<dyn SharedMap> = Arc::new(LocalSharedMap::new());
        let n1 = node(shared.clone(), Arc::new(ReloadBus::default()));
        let n2 = node(shared, Arc::new(ReloadBus::default()));

        for md in [
            provider("mod-a-1.0.0", "x", InterfaceType::Proxy),
            provider("mod-c-1.0.0", "y", InterfaceType::Proxy),
        ] {
            n1.modules.create(md).await.unwrap();
        }
        n1.tenants.create(Tenant::new("t")).await.unwrap();
        n2.tenants.reload().await.unwrap();

        // n2 still has the tenant without modules and has never seen mod-c
        n1.tenants.enable("t", "mod-a-1.0.0").await.unwrap();
        let t = n2.tenants.enable("t", "mod-c-1.0.0").await.unwrap();
        assert_eq!(t.enabled_modules, ["mod-a-1.0.0", "mod-c-1.0.0"]);
        assert_eq!(n2.tenants.load("t").await.unwrap().enabled_modules, t.enabled_modules);

        // disabling on the stale node works on the latest tenant too
        n1.tenants.disable("t", "mod-c").await.unwrap();
        let t = n2.tenants.disable("t", "mod-a").await.unwrap();
        assert!(t.enabled_modules.is_empty());
    }

    #[tokio::test]
    async fn test_module_use_is_cluster_wide() {
        let shared: Arc<dyn SharedMap> = Arc::new(LocalSharedMap::new());
        let n1 = node(shared.clone(), Arc::new(ReloadBus::default()));
        let n2 = node(shared, Arc::new(ReloadBus::default()));

        n1.modules
            .create(provider("mod-a-1.0.0", "x", InterfaceType::Proxy))
            .await
            .unwrap();
        let mut tenant = Tenant::new("t");
        tenant.enabled_modules = vec!["mod-a-1.0.0".to_string()];
        n1.tenants.create(tenant).await.unwrap();

        assert!(n2.tenants.get("t").is_err());
        assert!(n2.tenants.is_module_in_use("mod-a-1.0.0").await.unwrap());
        assert!(!n2.tenants.is_module_in_use("mod-b-1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_reload_fetches_remote_modules() {
        let shared: Arc<dyn SharedMap> = Arc::new(LocalSharedMap::new());
        let bus = Arc::new(ReloadBus::default());
        let n1 = node(shared.clone(), bus.clone());
        let n2 = node(shared, Arc::new(ReloadBus::default()));
        let mut signals = bus.subscribe();

        n1.tenants.create(Tenant::new("t")).await.unwrap();
        let created = signals.recv().await.unwrap();
        n2.tenants.apply_reload(&created).await.unwrap();

        // registered after n2 last looked at the modules
        n1.modules
            .create(provider("mod-a-1.0.0", "x", InterfaceType::Proxy))
            .await
            .unwrap();
        n1.tenants.enable("t", "mod-a-1.0.0").await.unwrap();
        let enabled = signals.recv().await.unwrap();
        assert!(n2.tenants.apply_reload(&enabled).await.unwrap());

        let modules = n2.tenants.enabled_modules("t").unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].id, "mod-a-1.0.0");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enables_from_two_nodes() {
        let shared: Arc<dyn SharedMap> = Arc::new(LocalSharedMap::new());
        let n1 = Arc::new(node(shared.clone(), Arc::new(ReloadBus::default())));
        let n2 = Arc::new(node(shared, Arc::new(ReloadBus::default())));

        let ids: Vec<String> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|p| format!("mod-{p}-1.0.0"))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            n1.modules
                .create(provider(id, &format!("iface{i}"), InterfaceType::Proxy))
                .await
                .unwrap();
        }
        n1.tenants.create(Tenant::new("t")).await.unwrap();
        n2.tenants.reload().await.unwrap();

        let handles: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let n = if i % 2 == 0 { n1.clone() } else { n2.clone() };
                let id = id.clone();
                tokio::spawn(async move { n.tenants.enable("t", &id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut enabled = n1.tenants.load("t").await.unwrap().enabled_modules;
        enabled.sort();
        assert_eq!(enabled, ids);
    }
}
