use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use tokio::sync::Mutex;

use crate::{config::Etcd, core::GatewayResult};

use super::shared_map::SharedMap;

/// Lazily (re)connected etcd client shared by the etcd-backed components.
pub struct EtcdConnection {
    config: Etcd,
    client: Mutex<Option<Client>>,
}

impl EtcdConnection {
    pub fn new(config: Etcd) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Etcd {
        &self.config
    }

    /// Full etcd key for `suffix` under the configured prefix.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.prefix.trim_end_matches('/'), suffix)
    }

    async fn create_client(&self) -> GatewayResult<Client> {
        let mut options = ConnectOptions::default();
        if let Some(timeout) = self.config.timeout {
            options = options.with_timeout(Duration::from_secs(timeout as u64));
        };
        if let Some(connect_timeout) = self.config.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(connect_timeout as u64));
        };
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            options = options.with_user(user.clone(), password.clone());
        };

        let client = Client::connect(self.config.host.clone(), Some(options)).await?;
        Ok(client)
    }

    /// Returns a handle to the client, connecting first when needed.
    pub async fn client(&self) -> GatewayResult<Client> {
        let mut client_guard = self.client.lock().await;

        if client_guard.is_none() {
            log::info!("Creating new etcd client...");
            *client_guard = Some(self.create_client().await?);
        }
        match client_guard.as_ref() {
            Some(client) => Ok(client.clone()),
            None => Err(crate::internal_error!("Etcd client is not initialized")),
        }
    }

    /// Drops the client so the next call reconnects.
    pub async fn reset(&self) {
        *self.client.lock().await = None;
    }

    async fn checked<T>(&self, result: Result<T, etcd_client::Error>) -> GatewayResult<T> {
        if let Err(err) = &result {
            log::warn!("Etcd request failed, resetting client: {err}");
            self.reset().await;
        }
        Ok(result?)
    }
}

/// [`SharedMap`] stored in etcd under `<prefix>/maps/`.
///
/// Conditional writes are etcd transactions comparing the current value.
pub struct EtcdSharedMap {
    conn: Arc<EtcdConnection>,
}

impl EtcdSharedMap {
    pub fn new(conn: Arc<EtcdConnection>) -> Self {
        Self { conn }
    }

    fn key(&self, key: &str) -> String {
        self.conn.key(&format!("maps/{key}"))
    }

    fn key_prefix(&self) -> String {
        self.conn.key("maps/")
    }

    async fn txn(&self, txn: Txn) -> GatewayResult<bool> {
        let mut client = self.conn.client().await?;
        let response = self.conn.checked(client.txn(txn).await).await?;
        Ok(response.succeeded())
    }
}

#[async_trait]
impl SharedMap for EtcdSharedMap {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut client = self.conn.client().await?;
        let response = self.conn.checked(client.get(self.key(key), None).await).await?;
        match response.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String) -> GatewayResult<()> {
        let mut client = self.conn.client().await?;
        self.conn
            .checked(client.put(self.key(key), value, None).await)
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> GatewayResult<bool> {
        let key = self.key(key);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        self.txn(txn).await
    }

    async fn replace(&self, key: &str, expected: &str, value: String) -> GatewayResult<bool> {
        let key = self.key(key);
        let txn = Txn::new()
            .when(vec![Compare::value(key.clone(), CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        self.txn(txn).await
    }

    async fn remove_if_value(&self, key: &str, expected: &str) -> GatewayResult<bool> {
        let key = self.key(key);
        let txn = Txn::new()
            .when(vec![Compare::value(key.clone(), CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(key, None)]);
        self.txn(txn).await
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        let prefix = self.key_prefix();
        let options = GetOptions::new().with_prefix().with_keys_only();

        let mut client = self.conn.client().await?;
        let response = self
            .conn
            .checked(client.get(prefix.as_str(), Some(options)).await)
            .await?;

        let mut keys = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            if let Some(key) = kv.key_str()?.strip_prefix(&prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}
