use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::sleep;

use crate::{core::status, proxy::Gateway};

/// Periodically refreshes modules and tenants from the registry and drops
/// deployments of nodes that left, catching up on anything a missed reload
/// signal or node event left behind.
pub struct ClusterMaintenance {
    gateway: Arc<Gateway>,
    interval: Duration,
}

impl ClusterMaintenance {
    pub fn new(gateway: Arc<Gateway>, interval: Duration) -> Self {
        Self { gateway, interval }
    }
}

#[async_trait]
impl BackgroundService for ClusterMaintenance {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.changed() => return,
            }
            // bootstrap loads the state first
            if !status::is_ready() {
                continue;
            }

            match self.gateway.maintain().await {
                Ok(0) => log::debug!("Cluster maintenance done"),
                Ok(pruned) => log::info!("Cluster maintenance dropped {pruned} stale deployments"),
                Err(e) => log::error!("Cluster maintenance failed: {e}"),
            }
        }
    }
}
