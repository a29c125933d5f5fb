//! Cluster membership kept in etcd.
//!
//! Every node holds `<prefix>/nodes/<node id>` under a lease it keeps alive.
//! When a node stops renewing, etcd deletes the key and the remaining nodes
//! drop the deployments it registered.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{EventType, GetOptions, PutOptions, WatchOptions};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::{sync::Mutex, time::sleep};

use crate::core::{ErrorContext, GatewayResult};

use super::{
    discovery::{ClusterMembership, DiscoveryManager},
    etcd::EtcdConnection,
};

const NODES: &str = "nodes/";

/// Nodes registered under `<prefix>/nodes/`.
pub struct EtcdMembership {
    conn: Arc<EtcdConnection>,
    node_id: String,
}

impl EtcdMembership {
    pub fn new(conn: Arc<EtcdConnection>, node_id: &str) -> Self {
        Self {
            conn,
            node_id: node_id.to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn node_key(&self, node_id: &str) -> String {
        self.conn.key(&format!("{NODES}{node_id}"))
    }

    fn nodes_prefix(&self) -> String {
        self.conn.key(NODES)
    }

    /// Node id of a key under the nodes prefix.
    fn node_of<'k>(&self, key: &'k str) -> Option<&'k str> {
        let prefix = self.nodes_prefix();
        key.strip_prefix(prefix.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[async_trait]
impl ClusterMembership for EtcdMembership {
    async fn list_nodes(&self) -> GatewayResult<Vec<String>> {
        let mut client = self.conn.client().await?;
        let response = self
            .conn
            .checked(
                client
                    .get(self.nodes_prefix(), Some(GetOptions::new().with_prefix().with_keys_only()))
                    .await,
            )
            .await?;

        let mut nodes = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv.key_str().with_context("Reading node key")?;
            if let Some(node_id) = self.node_of(key) {
                nodes.push(node_id.to_string());
            }
        }
        Ok(nodes)
    }
}

/// Keeps this node registered and prunes the deployments of nodes whose key
/// goes away.
pub struct EtcdMembershipSync {
    membership: Arc<EtcdMembership>,
    discovery: Arc<DiscoveryManager>,
    ttl: i64,
    lease: Mutex<Option<i64>>,
}

impl EtcdMembershipSync {
    pub fn new(
        membership: Arc<EtcdMembership>,
        discovery: Arc<DiscoveryManager>,
        ttl: i64,
    ) -> Self {
        Self {
            membership,
            discovery,
            ttl,
            lease: Mutex::new(None),
        }
    }

    fn conn(&self) -> &EtcdConnection {
        &self.membership.conn
    }

    /// Puts the node key under a fresh lease and returns the lease id.
    async fn register(&self) -> GatewayResult<i64> {
        let mut client = self.conn().client().await?;
        let lease = client
            .lease_grant(self.ttl, None)
            .await
            .with_context("Granting node lease")?
            .id();

        let options = PutOptions::new().with_lease(lease);
        client
            .put(
                self.membership.node_key(&self.membership.node_id),
                self.membership.node_id.clone(),
                Some(options),
            )
            .await?;
        *self.lease.lock().await = Some(lease);

        log::info!(
            "Node {} joined the cluster with lease {lease:x}",
            self.membership.node_id
        );
        Ok(lease)
    }

    async fn keep_alive(&self, lease: i64) -> GatewayResult<()> {
        let mut client = self.conn().client().await?;
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        let period = Duration::from_secs((self.ttl as u64 / 3).max(1));

        loop {
            keeper.keep_alive().await?;
            match stream.message().await? {
                Some(response) if response.ttl() > 0 => {}
                _ => return Err(crate::internal_error!("Node lease {:x} expired", lease)),
            }
            sleep(period).await;
        }
    }

    async fn watch(&self) -> GatewayResult<()> {
        let mut client = self.conn().client().await?;
        let (_watcher, mut stream) = client
            .watch(
                self.membership.nodes_prefix(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await?;

        while let Some(response) = stream.message().await? {
            if response.canceled() {
                break;
            }
            for event in response.events() {
                if !matches!(event.event_type(), EventType::Delete) {
                    continue;
                }
                let Some(kv) = event.kv() else { continue };
                let Some(node_id) = kv.key_str().ok().and_then(|k| self.membership.node_of(k))
                else {
                    continue;
                };
                if node_id == self.membership.node_id {
                    continue;
                }

                log::info!("Node {node_id} left the cluster");
                if let Err(e) = self.discovery.prune_node(node_id).await {
                    log::error!("Failed to drop deployments of node {node_id}: {e}");
                }
            }
        }
        Ok(())
    }

    async fn leave(&self) {
        let Some(lease) = self.lease.lock().await.take() else {
            return;
        };
        match self.conn().client().await {
            Ok(mut client) => {
                if let Err(e) = client.lease_revoke(lease).await {
                    log::warn!("Failed to revoke node lease {lease:x}: {e}");
                }
            }
            Err(e) => log::warn!("Leaving the cluster without revoking the lease: {e}"),
        }
    }

    async fn run(&self) -> GatewayResult<()> {
        let lease = self.register().await?;

        // nodes that left while this one was away
        let pruned = self.discovery.reconcile().await?;
        if pruned > 0 {
            log::info!("Dropped {pruned} deployments of departed nodes");
        }

        tokio::select! {
            res = self.keep_alive(lease) => res,
            res = self.watch() => res,
        }
    }
}

#[async_trait]
impl BackgroundService for EtcdMembershipSync {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        loop {
            if *shutdown.borrow() {
                self.leave().await;
                return;
            }

            tokio::select! {
                res = self.run() => {
                    if let Err(err) = res {
                        log::error!("Cluster membership failed: {err}");
                    }
                    self.conn().reset().await;
                    sleep(Duration::from_secs(1)).await;
                }
                _ = shutdown.changed() => {}
            }
        }
    }
}
