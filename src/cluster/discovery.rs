use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{GatewayError, GatewayResult};

use super::locked_map::LockedMap;

/// A running module instance reachable at `url`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptor {
    pub srvc_id: String,
    pub inst_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[async_trait]
pub trait ClusterMembership: Send + Sync {
    async fn list_nodes(&self) -> GatewayResult<Vec<String>>;
}

/// Fixed node list, e.g. just the local node when running stand-alone.
pub struct StaticMembership {
    nodes: Vec<String>,
}

impl StaticMembership {
    pub fn new(nodes: Vec<String>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn list_nodes(&self) -> GatewayResult<Vec<String>> {
        Ok(self.nodes.clone())
    }
}

/// Service id -> instance id -> deployment, shared by the cluster.
pub struct DiscoveryManager {
    deployments: LockedMap<DeploymentDescriptor>,
    membership: Arc<dyn ClusterMembership>,
}

impl DiscoveryManager {
    pub fn new(
        deployments: LockedMap<DeploymentDescriptor>,
        membership: Arc<dyn ClusterMembership>,
    ) -> Self {
        Self {
            deployments,
            membership,
        }
    }

    pub async fn add(&self, md: &DeploymentDescriptor) -> GatewayResult<()> {
        if md.srvc_id.is_empty() || md.inst_id.is_empty() {
            return Err(GatewayError::User(
                "Deployment needs srvcId and instId".to_string(),
            ));
        }
        self.deployments.add(&md.srvc_id, &md.inst_id, md).await?;
        log::info!(
            "Registered {}/{} on node {}",
            md.srvc_id,
            md.inst_id,
            md.node_id
        );
        Ok(())
    }

    /// Returns whether this was the last instance of the service.
    pub async fn remove(&self, srvc_id: &str, inst_id: &str) -> GatewayResult<bool> {
        let last = self.deployments.remove(srvc_id, inst_id).await?;
        log::info!("Unregistered {srvc_id}/{inst_id}");
        Ok(last)
    }

    pub async fn get(&self, srvc_id: &str, inst_id: &str) -> GatewayResult<DeploymentDescriptor> {
        self.deployments.get(srvc_id, inst_id).await
    }

    pub async fn get_all(&self, srvc_id: &str) -> GatewayResult<Vec<DeploymentDescriptor>> {
        self.deployments.get_all(srvc_id).await
    }

    pub async fn services(&self) -> GatewayResult<Vec<String>> {
        self.deployments.get_keys().await
    }

    pub async fn list(&self) -> GatewayResult<Vec<DeploymentDescriptor>> {
        let mut all = Vec::new();
        for srvc_id in self.services().await? {
            match self.get_all(&srvc_id).await {
                Ok(instances) => all.extend(instances),
                // removed since listing the keys
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(all)
    }

    /// Drops every instance registered by `node_id`. Returns how many went away.
    pub async fn prune_node(&self, node_id: &str) -> GatewayResult<usize> {
        self.prune(|md| md.node_id == node_id).await
    }

    /// Drops instances of nodes that left the cluster.
    pub async fn reconcile(&self) -> GatewayResult<usize> {
        let nodes: HashSet<String> = self.membership.list_nodes().await?.into_iter().collect();
        self.prune(|md| !nodes.contains(&md.node_id)).await
    }

    async fn prune<F>(&self, dead: F) -> GatewayResult<usize>
    where
        F: Fn(&DeploymentDescriptor) -> bool,
    {
        let mut pruned = 0;
        for md in self.list().await? {
            if !dead(&md) {
                continue;
            }
            match self.remove(&md.srvc_id, &md.inst_id).await {
                Ok(_) => pruned += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if pruned > 0 {
            log::info!("Pruned {pruned} instances of departed nodes");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cluster::shared_map::LocalSharedMap, config::RetryPolicy};

    fn manager(nodes: &[&str]) -> DiscoveryManager {
        DiscoveryManager::new(
            LockedMap::new(
                "discovery",
                Arc::new(LocalSharedMap::new()),
                RetryPolicy::default(),
            ),
            Arc::new(StaticMembership::new(
                nodes.iter().map(|n| n.to_string()).collect(),
            )),
        )
    }

    fn deployment(srvc: &str, inst: &str, node: &str) -> DeploymentDescriptor {
        DeploymentDescriptor {
            srvc_id: srvc.to_string(),
            inst_id: inst.to_string(),
            node_id: node.to_string(),
            url: Some(format!("http://{node}:9130")),
        }
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let dm = manager(&["n1"]);
        dm.add(&deployment("mod-a-1.0.0", "i1", "n1")).await.unwrap();
        dm.add(&deployment("mod-a-1.0.0", "i2", "n1")).await.unwrap();

        let err = dm.add(&deployment("mod-a-1.0.0", "i1", "n1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::User(_)));
        assert!(dm.add(&deployment("", "i1", "n1")).await.is_err());

        assert_eq!(dm.get("mod-a-1.0.0", "i2").await.unwrap().inst_id, "i2");
        assert_eq!(dm.get_all("mod-a-1.0.0").await.unwrap().len(), 2);
        assert_eq!(dm.services().await.unwrap(), ["mod-a-1.0.0"]);

        assert!(!dm.remove("mod-a-1.0.0", "i1").await.unwrap());
        assert!(dm.remove("mod-a-1.0.0", "i2").await.unwrap());
        assert!(dm.get_all("mod-a-1.0.0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_prune_and_reconcile() {
        let dm = manager(&["n1"]);
        dm.add(&deployment("mod-a-1.0.0", "i1", "n1")).await.unwrap();
        dm.add(&deployment("mod-a-1.0.0", "i2", "n2")).await.unwrap();
        dm.add(&deployment("mod-b-1.0.0", "i3", "n3")).await.unwrap();

        assert_eq!(dm.prune_node("n3").await.unwrap(), 1);
        assert_eq!(dm.services().await.unwrap(), ["mod-a-1.0.0"]);

        assert_eq!(dm.reconcile().await.unwrap(), 1);
        let left = dm.list().await.unwrap();
        assert_eq!(left, [deployment("mod-a-1.0.0", "i1", "n1")]);
        assert_eq!(dm.reconcile().await.unwrap(), 0);
    }
}
