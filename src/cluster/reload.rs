//! Tenant reload signals.
//!
//! After a successful tenant write, the writing node publishes a
//! [`ReloadSignal`]. Other nodes re-read the tenant only when the signal is
//! newer than what they applied last, so duplicate or reordered signals are
//! harmless.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{EventType, GetOptions, KeyValue, WatchOptions};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, Mutex},
    time::sleep,
};

use crate::core::GatewayResult;

use super::etcd::EtcdConnection;

const SIGNALS: &str = "signals/";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSignal {
    pub tenant: String,
    pub timestamp: u64,
}

#[async_trait]
pub trait ReloadPublisher: Send + Sync {
    async fn publish(&self, signal: ReloadSignal) -> GatewayResult<()>;
}

/// Receiving side of reload signals, implemented by the tenant manager.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    /// Returns whether the signal caused a reload.
    async fn apply_reload(&self, signal: &ReloadSignal) -> GatewayResult<bool>;
}

/// Last applied timestamp per tenant.
#[derive(Default)]
pub struct ReloadTracker {
    applied: DashMap<String, u64>,
}

impl ReloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_newer(&self, signal: &ReloadSignal) -> bool {
        self.applied
            .get(&signal.tenant)
            .map_or(true, |ts| signal.timestamp > *ts)
    }

    /// Records `timestamp` unless a newer one was recorded already.
    pub fn mark(&self, tenant: &str, timestamp: u64) {
        let mut entry = self.applied.entry(tenant.to_string()).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    pub fn last_applied(&self, tenant: &str) -> Option<u64> {
        self.applied.get(tenant).map(|ts| *ts)
    }
}

/// In-process publisher; the only one needed on a single node.
pub struct ReloadBus {
    sender: broadcast::Sender<ReloadSignal>,
}

impl ReloadBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadSignal> {
        self.sender.subscribe()
    }
}

impl Default for ReloadBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl ReloadPublisher for ReloadBus {
    async fn publish(&self, signal: ReloadSignal) -> GatewayResult<()> {
        // no receivers is fine
        let _ = self.sender.send(signal);
        Ok(())
    }
}

/// Publishes signals as `<prefix>/signals/<tenant>` keys.
pub struct EtcdReloadPublisher {
    conn: Arc<EtcdConnection>,
}

impl EtcdReloadPublisher {
    pub fn new(conn: Arc<EtcdConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReloadPublisher for EtcdReloadPublisher {
    async fn publish(&self, signal: ReloadSignal) -> GatewayResult<()> {
        let key = self.conn.key(&format!("{SIGNALS}{}", signal.tenant));
        let value = serde_json::to_string(&signal)?;

        let mut client = self.conn.client().await?;
        if let Err(err) = client.put(key, value, None).await {
            self.conn.reset().await;
            return Err(err.into());
        }
        Ok(())
    }
}

/// Watches the etcd signal keys and hands every signal to a [`ReloadHandler`].
pub struct EtcdReloadSync {
    conn: Arc<EtcdConnection>,
    revision: Mutex<i64>,
    handler: Arc<dyn ReloadHandler>,
}

impl EtcdReloadSync {
    pub fn new(conn: Arc<EtcdConnection>, handler: Arc<dyn ReloadHandler>) -> Self {
        Self {
            conn,
            revision: Mutex::new(0),
            handler,
        }
    }

    async fn handle_kv(&self, kv: &KeyValue) {
        let signal: ReloadSignal = match serde_json::from_slice(kv.value()) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!("Ignoring malformed reload signal: {e}");
                return;
            }
        };
        match self.handler.apply_reload(&signal).await {
            Ok(true) => log::info!(
                "Tenant {} reloaded at timestamp {}",
                signal.tenant,
                signal.timestamp
            ),
            Ok(false) => {}
            Err(e) => log::error!("Failed to reload tenant {}: {e}", signal.tenant),
        }
    }

    /// Applies every signal currently stored.
    async fn list(&self) -> GatewayResult<()> {
        let options = GetOptions::new().with_prefix();
        let mut client = self.conn.client().await?;

        let response = client.get(self.conn.key(SIGNALS), Some(options)).await?;
        let revision = response.header().map_or(0, |h| h.revision());
        *self.revision.lock().await = revision;

        for kv in response.kvs() {
            self.handle_kv(kv).await;
        }
        Ok(())
    }

    async fn watch(&self) -> GatewayResult<()> {
        let start_revision = *self.revision.lock().await + 1;
        let options = WatchOptions::new()
            .with_start_revision(start_revision)
            .with_prefix();

        let mut client = self.conn.client().await?;
        let (mut watcher, mut stream) = client.watch(self.conn.key(SIGNALS), Some(options)).await?;

        watcher.request_progress().await?;

        while let Some(response) = stream.message().await? {
            if response.canceled() {
                break;
            }

            for event in response.events() {
                if !matches!(event.event_type(), EventType::Put) {
                    continue;
                }
                if let Some(kv) = event.kv() {
                    *self.revision.lock().await = kv.mod_revision();
                    self.handle_kv(kv).await;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundService for EtcdReloadSync {
    async fn start(&self, shutdown: ShutdownWatch) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            log::info!("Executing etcd list of reload signals...");
            if let Err(err) = self.list().await {
                log::error!("List operation failed: {err}");
                self.conn.reset().await;
                sleep(Duration::from_secs(3)).await;
                continue;
            }

            log::info!("Watching etcd reload signals...");
            if let Err(err) = self.watch().await {
                log::error!("Watch operation failed: {err}");
                self.conn.reset().await;
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(tenant: &str, timestamp: u64) -> ReloadSignal {
        ReloadSignal {
            tenant: tenant.to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_tracker_only_newer() {
        let tracker = ReloadTracker::new();
        assert!(tracker.is_newer(&signal("t", 1)));

        tracker.mark("t", 5);
        assert!(!tracker.is_newer(&signal("t", 5)));
        assert!(!tracker.is_newer(&signal("t", 3)));
        assert!(tracker.is_newer(&signal("t", 6)));
        assert!(tracker.is_newer(&signal("other", 1)));

        // out of order marks keep the newest
        tracker.mark("t", 2);
        assert_eq!(tracker.last_applied("t"), Some(5));
        assert_eq!(tracker.last_applied("other"), None);
    }

    #[tokio::test]
    async fn test_bus_delivers() {
        let bus = ReloadBus::default();
        bus.publish(signal("nobody-listens", 1)).await.unwrap();

        let mut rx = bus.subscribe();
        bus.publish(signal("t", 7)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), signal("t", 7));
    }
}
