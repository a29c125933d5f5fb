//! Starting module instances and registering them for discovery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use http::Uri;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, time::sleep};

use crate::{
    cluster::{DeploymentDescriptor, DiscoveryManager},
    config::Deploy,
    core::{GatewayError, GatewayResult},
    manager::ModuleManager,
};

/// A module instance whose lifetime this node controls.
#[async_trait]
pub trait ModuleProcess: Send + Sync {
    async fn start(&self) -> GatewayResult<()>;

    async fn stop(&self) -> GatewayResult<()>;

    /// Where the instance listens, known once started.
    fn url(&self) -> Option<String>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, srvc_id: &str, inst_id: &str) -> GatewayResult<Box<dyn ModuleProcess>>;
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, url: &str) -> GatewayResult<bool>;
}

/// Instance started and stopped by someone else, already listening at `url`.
pub struct ExternalProcess {
    url: String,
}

impl ExternalProcess {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl ModuleProcess for ExternalProcess {
    async fn start(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn stop(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

/// Alive when a TCP connection to the url's authority succeeds.
#[derive(Default)]
pub struct TcpLivenessProbe;

#[async_trait]
impl LivenessProbe for TcpLivenessProbe {
    async fn is_alive(&self, url: &str) -> GatewayResult<bool> {
        let uri: Uri = url
            .parse()
            .map_err(|e| GatewayError::User(format!("Invalid url {url}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| GatewayError::User(format!("Invalid url {url}: no host")))?;
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        Ok(TcpStream::connect((host, port)).await.is_ok())
    }
}

/// Deployment request as accepted by the admin API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub srvc_id: String,
    pub inst_id: Option<String>,
    /// Address of an already running instance; nothing is launched then.
    pub url: Option<String>,
}

pub struct DeploymentManager {
    node_id: String,
    policy: Deploy,
    modules: Arc<ModuleManager>,
    discovery: Arc<DiscoveryManager>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    probe: Arc<dyn LivenessProbe>,
    running: DashMap<(String, String), Box<dyn ModuleProcess>>,
}

impl DeploymentManager {
    pub fn new(
        node_id: &str,
        policy: Deploy,
        modules: Arc<ModuleManager>,
        discovery: Arc<DiscoveryManager>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            policy,
            modules,
            discovery,
            launcher: None,
            probe,
            running: DashMap::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub async fn deploy(&self, req: DeployRequest) -> GatewayResult<DeploymentDescriptor> {
        self.modules.get(&req.srvc_id)?;
        let inst_id = req
            .inst_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = (req.srvc_id.clone(), inst_id.clone());
        if self.running.contains_key(&key) {
            return Err(GatewayError::User(format!(
                "Instance {}/{} already deployed",
                req.srvc_id, inst_id
            )));
        }

        let process: Box<dyn ModuleProcess> = match (&req.url, &self.launcher) {
            (Some(url), _) => Box::new(ExternalProcess::new(url)),
            (None, Some(launcher)) => launcher.launch(&req.srvc_id, &inst_id)?,
            (None, None) => {
                return Err(GatewayError::User(format!(
                    "No url for {} and no launcher configured",
                    req.srvc_id
                )))
            }
        };

        process.start().await?;
        let url = match process.url() {
            Some(url) => url,
            None => {
                self.stop_quietly(process.as_ref(), &req.srvc_id).await;
                return Err(GatewayError::Internal(format!(
                    "{} started without an url",
                    req.srvc_id
                )));
            }
        };

        if let Err(e) = self.wait_alive(&req.srvc_id, &url).await {
            self.stop_quietly(process.as_ref(), &req.srvc_id).await;
            return Err(e);
        }

        let md = DeploymentDescriptor {
            srvc_id: req.srvc_id.clone(),
            inst_id,
            node_id: self.node_id.clone(),
            url: Some(url),
        };
        if let Err(e) = self.discovery.add(&md).await {
            self.stop_quietly(process.as_ref(), &req.srvc_id).await;
            return Err(e);
        }

        self.running.insert(key, process);
        Ok(md)
    }

    pub async fn undeploy(&self, srvc_id: &str, inst_id: &str) -> GatewayResult<()> {
        let (_, process) = self
            .running
            .remove(&(srvc_id.to_string(), inst_id.to_string()))
            .ok_or_else(|| {
                GatewayError::NotFound(format!("Instance {srvc_id}/{inst_id} not deployed here"))
            })?;

        process.stop().await?;
        match self.discovery.remove(srvc_id, inst_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Instances started by this node.
    pub fn running(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.running.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Polls the probe with doubling backoff until it reports the instance alive.
    async fn wait_alive(&self, srvc_id: &str, url: &str) -> GatewayResult<()> {
        let mut backoff = Duration::from_millis(self.policy.liveness_backoff);
        let max_backoff = Duration::from_millis(self.policy.liveness_backoff_max);

        for attempt in 1..=self.policy.liveness_retries {
            match self.probe.is_alive(url).await {
                Ok(true) => {
                    log::debug!("{srvc_id} at {url} alive after {attempt} probes");
                    return Ok(());
                }
                Ok(false) => log::debug!("{srvc_id} at {url} not alive yet ({attempt})"),
                Err(e) => log::warn!("Liveness probe of {srvc_id} failed: {e}"),
            }
            if attempt < self.policy.liveness_retries {
                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        Err(GatewayError::Internal(format!(
            "{srvc_id} at {url} not alive after {} probes",
            self.policy.liveness_retries
        )))
    }

    async fn stop_quietly(&self, process: &dyn ModuleProcess, srvc_id: &str) {
        if let Err(e) = process.stop().await {
            log::warn!("Failed to stop {srvc_id}: {e}");
        }
    }
}
