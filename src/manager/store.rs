use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use crate::core::{GatewayError, GatewayResult};

/// Persistent storage of descriptors, keyed by id.
#[async_trait]
pub trait DescriptorStore<T>: Send + Sync {
    /// Fails with a user error when `id` exists.
    async fn insert(&self, id: &str, value: &T) -> GatewayResult<()>;

    /// Fails with not-found when `id` does not exist.
    async fn update(&self, id: &str, value: &T) -> GatewayResult<()>;

    async fn get(&self, id: &str) -> GatewayResult<T>;

    /// Every descriptor, ordered by id.
    async fn get_all(&self) -> GatewayResult<Vec<T>>;

    async fn delete(&self, id: &str) -> GatewayResult<()>;
}

/// Store kept in process memory.
pub struct MemoryStore<T> {
    entries: DashMap<String, T>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<T> DescriptorStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    async fn insert(&self, id: &str, value: &T) -> GatewayResult<()> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::User(format!("Duplicate id {id}"))),
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, id: &str, value: &T) -> GatewayResult<()> {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                *entry = value.clone();
                Ok(())
            }
            None => Err(GatewayError::NotFound(format!("{id} not found"))),
        }
    }

    async fn get(&self, id: &str) -> GatewayResult<T> {
        self.entries
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("{id} not found")))
    }

    async fn get_all(&self) -> GatewayResult<Vec<T>> {
        let mut all: Vec<(String, T)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all.into_iter().map(|(_, v)| v).collect())
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        self.entries
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("{id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::<String>::new();
        store.insert("b", &"B".to_string()).await.unwrap();
        store.insert("a", &"A".to_string()).await.unwrap();
        assert!(matches!(
            store.insert("a", &"A2".to_string()).await,
            Err(GatewayError::User(_))
        ));

        store.update("a", &"A3".to_string()).await.unwrap();
        assert!(store.update("c", &"C".to_string()).await.unwrap_err().is_not_found());

        assert_eq!(store.get("a").await.unwrap(), "A3");
        assert_eq!(store.get_all().await.unwrap(), ["A3", "B"]);

        store.delete("a").await.unwrap();
        assert!(store.delete("a").await.unwrap_err().is_not_found());
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }
}
