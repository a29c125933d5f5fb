use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use crate::core::GatewayResult;

/// Cluster-wide atomic string map.
///
/// Every mutation is atomic with respect to other writers of the same key.
/// `replace` and `remove_if_value` only act when the stored value equals the
/// expected one, which makes the value itself the compare-and-swap token.
#[async_trait]
pub trait SharedMap: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn put(&self, key: &str, value: String) -> GatewayResult<()>;

    /// Returns `false` when the key already holds a value.
    async fn put_if_absent(&self, key: &str, value: String) -> GatewayResult<bool>;

    /// Returns `false` when the stored value is not `expected`.
    async fn replace(&self, key: &str, expected: &str, value: String) -> GatewayResult<bool>;

    /// Returns `false` when the stored value is not `expected`.
    async fn remove_if_value(&self, key: &str, expected: &str) -> GatewayResult<bool>;

    async fn keys(&self) -> GatewayResult<Vec<String>>;
}

/// In-process map for single-node deployments and tests.
#[derive(Default)]
pub struct LocalSharedMap {
    entries: DashMap<String, String>,
}

impl LocalSharedMap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedMap for LocalSharedMap {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> GatewayResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: String) -> GatewayResult<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(true)
            }
        }
    }

    async fn replace(&self, key: &str, expected: &str, value: String) -> GatewayResult<bool> {
        match self.entries.get_mut(key) {
            Some(mut current) if current.value() == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_if_value(&self, key: &str, expected: &str) -> GatewayResult<bool> {
        Ok(self.entries.remove_if(key, |_, v| v == expected).is_some())
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_cas() {
        let map = LocalSharedMap::new();
        assert!(map.put_if_absent("k", "a".to_string()).await.unwrap());
        assert!(!map.put_if_absent("k", "b".to_string()).await.unwrap());
        assert_eq!(map.get("k").await.unwrap().as_deref(), Some("a"));

        assert!(!map.replace("k", "b", "c".to_string()).await.unwrap());
        assert!(map.replace("k", "a", "c".to_string()).await.unwrap());
        assert!(!map.replace("missing", "a", "c".to_string()).await.unwrap());

        assert!(!map.remove_if_value("k", "a").await.unwrap());
        assert!(map.remove_if_value("k", "c").await.unwrap());
        assert!(map.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_keys() {
        let map = LocalSharedMap::new();
        map.put("a", "1".to_string()).await.unwrap();
        map.put("b", "2".to_string()).await.unwrap();
        map.put("a", "3".to_string()).await.unwrap();

        let mut keys = map.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(map.get("a").await.unwrap().as_deref(), Some("3"));
    }
}
