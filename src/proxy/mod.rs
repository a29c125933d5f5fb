//! The gateway facade: wires the cluster maps, managers and resolver together
//! and resolves pipelines for incoming requests.

use std::sync::Arc;

use http::HeaderMap;

use crate::{
    cluster::{
        ClusterMembership, DeploymentDescriptor, DiscoveryManager, EtcdConnection,
        EtcdMembership, EtcdMembershipSync, EtcdReloadPublisher, EtcdReloadSync, EtcdSharedMap,
        LocalSharedMap, LockedMap, ReloadBus, ReloadPublisher, SharedMap, StaticMembership,
    },
    config::{self, Config, TenantConfig},
    core::{GatewayError, GatewayResult},
    deploy::{DeploymentManager, TcpLivenessProbe},
    manager::{MemoryStore, ModuleManager, Tenant, TenantManager},
    module::ModuleDescriptor,
    pipeline::{Pipeline, PipelineCursor, PipelineResolver},
    utils::TtlCache,
};

/// Tenant, tenant timestamp, method, path and incoming permissions header.
type PipelineKey = (String, u64, Option<String>, String, Option<String>);

pub struct Gateway {
    config: config::Gateway,
    modules: Arc<ModuleManager>,
    tenants: Arc<TenantManager>,
    discovery: Arc<DiscoveryManager>,
    deployments: Arc<DeploymentManager>,
    resolver: PipelineResolver,
    pipelines: TtlCache<PipelineKey, Arc<Pipeline>>,
    etcd: Option<Arc<EtcdConnection>>,
    membership: Option<Arc<EtcdMembership>>,
    node_ttl: i64,
}

impl Gateway {
    /// Builds the gateway on etcd when configured, otherwise on in-process maps.
    pub fn new(config: &Config) -> Self {
        match &config.cluster.etcd {
            Some(etcd) => {
                let conn = Arc::new(EtcdConnection::new(etcd.clone()));
                let membership =
                    Arc::new(EtcdMembership::new(conn.clone(), &config.cluster.node_id));
                let mut gateway = Self::with_shared_map(
                    config,
                    Arc::new(EtcdSharedMap::new(conn.clone())),
                    Arc::new(EtcdReloadPublisher::new(conn.clone())),
                    membership.clone(),
                );
                gateway.etcd = Some(conn);
                gateway.membership = Some(membership);
                gateway
            }
            None => Self::with_shared_map(
                config,
                Arc::new(LocalSharedMap::new()),
                Arc::new(ReloadBus::default()),
                Arc::new(StaticMembership::new(vec![config.cluster.node_id.clone()])),
            ),
        }
    }

    pub fn with_shared_map(
        config: &Config,
        shared: Arc<dyn SharedMap>,
        publisher: Arc<dyn ReloadPublisher>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        let retry = config.cluster.locked_map.clone();

        let modules = Arc::new(ModuleManager::new(
            Arc::new(MemoryStore::new()),
            LockedMap::new("modules", shared.clone(), retry.clone()),
        ));
        let tenants = Arc::new(TenantManager::new(
            Arc::new(MemoryStore::new()),
            LockedMap::new("tenants", shared.clone(), retry.clone()),
            modules.clone(),
            publisher,
        ));

        let discovery = Arc::new(DiscoveryManager::new(
            LockedMap::new("discovery", shared, retry),
            membership,
        ));
        let deployments = Arc::new(DeploymentManager::new(
            &config.cluster.node_id,
            config.deploy.clone(),
            modules.clone(),
            discovery.clone(),
            Arc::new(TcpLivenessProbe),
        ));

        Self {
            config: config.gateway.clone(),
            modules,
            tenants,
            discovery,
            deployments,
            resolver: PipelineResolver::new(config.gateway.resolver_options()),
            pipelines: TtlCache::new(
                config.gateway.pipeline_cache_capacity,
                config.gateway.pipeline_cache_ttl(),
            ),
            etcd: None,
            membership: None,
            node_ttl: config.cluster.node_ttl,
        }
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub fn tenants(&self) -> &Arc<TenantManager> {
        &self.tenants
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub fn deployments(&self) -> &Arc<DeploymentManager> {
        &self.deployments
    }

    pub fn settings(&self) -> &config::Gateway {
        &self.config
    }

    /// Background service applying reload signals of other nodes, in cluster mode.
    pub fn reload_sync(&self) -> Option<EtcdReloadSync> {
        self.etcd
            .as_ref()
            .map(|conn| EtcdReloadSync::new(conn.clone(), self.tenants.clone()))
    }

    /// Background service keeping this node registered, in cluster mode.
    pub fn membership_sync(&self) -> Option<EtcdMembershipSync> {
        self.membership.as_ref().map(|membership| {
            EtcdMembershipSync::new(membership.clone(), self.discovery.clone(), self.node_ttl)
        })
    }

    /// Refreshes modules and tenants from the registry and drops deployments
    /// of nodes that left.
    pub async fn maintain(&self) -> GatewayResult<usize> {
        self.modules.reload().await?;
        self.tenants.reload().await?;
        self.discovery.reconcile().await
    }

    /// Loads the cluster state, then provisions the configured modules and tenants.
    pub async fn bootstrap(
        &self,
        modules: &[ModuleDescriptor],
        tenants: &[TenantConfig],
    ) -> GatewayResult<()> {
        self.modules.reload().await?;
        self.tenants.reload().await?;

        for md in modules {
            log::info!("Provisioning module {}", md.id);
            self.modules.ensure(md.clone()).await?;
        }
        for tc in tenants {
            log::info!("Provisioning tenant {}", tc.id);
            let mut tenant = Tenant::new(&tc.id);
            tenant.description = tc.description.clone();
            tenant.enabled_modules = tc.modules.clone();
            self.tenants.ensure(tenant).await?;
        }

        let pruned = self.discovery.reconcile().await?;
        if pruned > 0 {
            log::info!("Dropped {pruned} stale deployments");
        }
        Ok(())
    }

    /// Deletes a module no tenant of the cluster has enabled.
    pub async fn delete_module(&self, id: &str) -> GatewayResult<()> {
        let in_use = || GatewayError::User(format!("Module {id} is enabled for a tenant"));
        if self.tenants.is_module_in_use(id).await? {
            return Err(in_use());
        }

        let md = self.modules.fetch(id).await?;
        self.modules.delete(id).await?;

        // a tenant enabled it between the check and the removal
        if self.tenants.is_module_in_use(id).await? {
            log::warn!("Module {id} was enabled while being deleted, restoring it");
            self.modules.create(md.as_ref().clone()).await?;
            return Err(in_use());
        }
        Ok(())
    }

    pub fn tenant_id(&self, headers: &HeaderMap) -> GatewayResult<String> {
        let value = headers
            .get(self.config.tenant_header.as_str())
            .ok_or_else(|| {
                GatewayError::User(format!("Missing {} header", self.config.tenant_header))
            })?;
        value
            .to_str()
            .map(str::to_string)
            .map_err(|_| GatewayError::User(format!("Invalid {} header", self.config.tenant_header)))
    }

    /// Pipeline for a request whose tenant comes from the tenant header.
    pub fn resolve_request(
        &self,
        method: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> GatewayResult<Arc<Pipeline>> {
        let tenant_id = self.tenant_id(headers)?;
        self.resolve_pipeline(&tenant_id, method, path, headers)
    }

    pub fn resolve_pipeline(
        &self,
        tenant_id: &str,
        method: Option<&str>,
        path: &str,
        headers: &HeaderMap,
    ) -> GatewayResult<Arc<Pipeline>> {
        let tenant = self.tenants.get(tenant_id)?;

        let permissions = headers
            .get(self.config.permissions_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let key = (
            tenant.id.clone(),
            tenant.timestamp,
            method.map(str::to_string),
            path.to_string(),
            permissions,
        );
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline);
        }

        let modules = self.modules.get_many(&tenant.enabled_modules)?;
        let pipeline = Arc::new(self.resolver.resolve(&modules, method, path, headers)?);
        self.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Feeds the response headers of the current stage to `cursor`, which
    /// stops once a module answers with the stop header.
    pub fn observe_response(&self, cursor: &mut PipelineCursor<'_>, headers: &HeaderMap) {
        cursor.observe(headers, &self.config.stop_header);
    }

    /// Instances of `srvc_id`, or of every service.
    pub async fn deployments_of(
        &self,
        srvc_id: Option<&str>,
    ) -> GatewayResult<Vec<DeploymentDescriptor>> {
        match srvc_id {
            Some(srvc_id) => self.discovery.get_all(srvc_id).await,
            None => self.discovery.list().await,
        }
    }
}
