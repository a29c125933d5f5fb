use std::{collections::BTreeMap, marker::PhantomData, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;

use crate::{
    config::RetryPolicy,
    core::{GatewayError, GatewayResult},
};

use super::shared_map::SharedMap;

static CAS_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "locked_map_cas_retries_total",
        "Compare-and-swap conflicts retried by the locked maps",
        &["map"]
    )
    .unwrap()
});

/// Two-level map (`primary -> secondary -> value`) shared by the cluster.
///
/// All secondaries of a primary key live in one JSON blob stored under that
/// key. Writers read the blob, modify it and write it back with a
/// compare-and-swap on the blob they read. A writer losing the race retries
/// with a fresh read after a short delay.
pub struct LockedMap<T> {
    name: String,
    map: Arc<dyn SharedMap>,
    retry: RetryPolicy,
    _marker: PhantomData<fn() -> T>,
}

type Blob<T> = BTreeMap<String, T>;

impl<T> LockedMap<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(name: &str, map: Arc<dyn SharedMap>, retry: RetryPolicy) -> Self {
        Self {
            name: name.to_string(),
            map,
            retry,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts `value`, failing when `secondary` already exists under `primary`.
    pub async fn add(&self, primary: &str, secondary: &str, value: &T) -> GatewayResult<()> {
        self.modify(primary, |blob| {
            if blob.contains_key(secondary) {
                return Err(GatewayError::User(format!(
                    "Duplicate key {primary}/{secondary} in {}",
                    self.name
                )));
            }
            blob.insert(secondary.to_string(), value.clone());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Inserts or overwrites `value`.
    pub async fn put(&self, primary: &str, secondary: &str, value: &T) -> GatewayResult<()> {
        self.modify(primary, |blob| {
            blob.insert(secondary.to_string(), value.clone());
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Applies `f` to the stored value and writes the result back, re-reading
    /// and re-applying on conflict. `f` may run more than once.
    pub async fn update<F>(&self, primary: &str, secondary: &str, mut f: F) -> GatewayResult<T>
    where
        F: FnMut(&mut T) -> GatewayResult<()> + Send,
    {
        let (value, _) = self
            .modify(primary, |blob| {
                let value = blob.get_mut(secondary).ok_or_else(|| {
                    GatewayError::NotFound(format!(
                        "Key {primary}/{secondary} not found in {}",
                        self.name
                    ))
                })?;
                f(value)?;
                Ok(value.clone())
            })
            .await?;
        Ok(value)
    }

    /// Removes `secondary`. Returns whether the whole primary entry went away.
    pub async fn remove(&self, primary: &str, secondary: &str) -> GatewayResult<bool> {
        let (_, deleted) = self
            .modify(primary, |blob| {
                blob.remove(secondary).map(|_| ()).ok_or_else(|| {
                    GatewayError::NotFound(format!(
                        "Key {primary}/{secondary} not found in {}",
                        self.name
                    ))
                })
            })
            .await?;
        Ok(deleted)
    }

    pub async fn get(&self, primary: &str, secondary: &str) -> GatewayResult<T> {
        let (_, blob) = self.read(primary).await?;
        blob.get(secondary).cloned().ok_or_else(|| {
            GatewayError::NotFound(format!(
                "Key {primary}/{secondary} not found in {}",
                self.name
            ))
        })
    }

    /// All values under `primary`, ordered by secondary key.
    pub async fn get_all(&self, primary: &str) -> GatewayResult<Vec<T>> {
        let (raw, blob) = self.read(primary).await?;
        if raw.is_none() {
            return Err(GatewayError::NotFound(format!(
                "Key {primary} not found in {}",
                self.name
            )));
        }
        Ok(blob.into_values().collect())
    }

    /// Primary keys, sorted.
    pub async fn get_keys(&self) -> GatewayResult<Vec<String>> {
        let prefix = self.key_prefix();
        let mut keys: Vec<String> = self
            .map
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn key_prefix(&self) -> String {
        format!("{}/", self.name)
    }

    fn shared_key(&self, primary: &str) -> String {
        format!("{}{}", self.key_prefix(), primary)
    }

    async fn read(&self, primary: &str) -> GatewayResult<(Option<String>, Blob<T>)> {
        let raw = self.map.get(&self.shared_key(primary)).await?;
        let blob = match &raw {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                GatewayError::Internal(format!(
                    "Corrupt entry {primary} in {}: {e}",
                    self.name
                ))
            })?,
            None => Blob::new(),
        };
        Ok((raw, blob))
    }

    /// Read-modify-write of the blob under `primary`, retried on conflict.
    /// Returns the closure result and whether the primary entry was deleted.
    async fn modify<R, F>(&self, primary: &str, mut f: F) -> GatewayResult<(R, bool)>
    where
        F: FnMut(&mut Blob<T>) -> GatewayResult<R> + Send,
        R: Send,
    {
        let key = self.shared_key(primary);

        for attempt in 1..=self.retry.max_attempts {
            let (raw, mut blob) = self.read(primary).await?;
            let result = f(&mut blob)?;

            let (written, deleted) = match (&raw, blob.is_empty()) {
                (None, true) => return Ok((result, false)),
                (None, false) => (
                    self.map.put_if_absent(&key, serde_json::to_string(&blob)?).await?,
                    false,
                ),
                (Some(old), true) => (self.map.remove_if_value(&key, old).await?, true),
                (Some(old), false) => (
                    self.map
                        .replace(&key, old, serde_json::to_string(&blob)?)
                        .await?,
                    false,
                ),
            };

            if written {
                return Ok((result, deleted));
            }

            CAS_RETRIES.with_label_values(&[self.name.as_str()]).inc();
            log::debug!(
                "Conflict on {} in {}, attempt {}/{}",
                primary,
                self.name,
                attempt,
                self.retry.max_attempts
            );
            sleep(self.retry_delay()).await;
        }

        log::warn!(
            "Giving up on {} in {} after {} attempts",
            primary,
            self.name,
            self.retry.max_attempts
        );
        Err(GatewayError::Internal(format!(
            "Too many conflicts updating {primary} in {}",
            self.name
        )))
    }

    fn retry_delay(&self) -> Duration {
        let jitter = if self.retry.jitter > 0 {
            rand::thread_rng().gen_range(0..=self.retry.jitter)
        } else {
            0
        };
        Duration::from_millis(self.retry.delay + jitter)
    }
}
