use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::sleep;

use crate::{
    config::TenantConfig,
    core::{
        status::{self, StateSource},
        GatewayResult,
    },
    module::ModuleDescriptor,
    proxy::Gateway,
};

const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Provisions the statically configured modules and tenants once the server
/// runtime is up, retrying until the registry is reachable.
pub struct GatewayBootstrap {
    gateway: Arc<Gateway>,
    modules: Vec<ModuleDescriptor>,
    tenants: Vec<TenantConfig>,
    source: StateSource,
}

impl GatewayBootstrap {
    pub fn new(
        gateway: Arc<Gateway>,
        modules: Vec<ModuleDescriptor>,
        tenants: Vec<TenantConfig>,
        source: StateSource,
    ) -> Self {
        Self {
            gateway,
            modules,
            tenants,
            source,
        }
    }

    pub async fn run_once(&self) -> GatewayResult<()> {
        self.gateway.bootstrap(&self.modules, &self.tenants).await
    }
}

#[async_trait]
impl BackgroundService for GatewayBootstrap {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.run_once().await {
                Ok(()) => {
                    status::mark_ready(self.source);
                    return;
                }
                Err(e) => log::error!("Bootstrap failed, retrying: {e}"),
            }

            tokio::select! {
                _ = sleep(RETRY_DELAY) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
