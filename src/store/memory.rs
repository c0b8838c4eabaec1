use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ClaimIndex, Repository};
use crate::error::Result;

pub struct InMemoryRepository<T> {
    items: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, value: T) -> Result<()> {
        self.items.write().await.insert(id.to_string(), value);
        Ok(())
    }

    async fn insert_if_absent(&self, id: &str, value: T) -> Result<bool> {
        let mut items = self.items.write().await;
        if items.contains_key(id) {
            return Ok(false);
        }
        items.insert(id.to_string(), value);
        Ok(true)
    }

    async fn values(&self) -> Result<Vec<T>> {
        Ok(self.items.read().await.values().cloned().collect())
    }
}

pub struct InMemoryClaimIndex {
    claims: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryClaimIndex {
    pub fn new() -> Self {
        Self {
            claims: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn holder(&self, key: &str) -> Option<String> {
        self.claims.read().await.get(key).cloned()
    }
}

impl Default for InMemoryClaimIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimIndex for InMemoryClaimIndex {
    async fn claim(&self, key: &str, holder: &str) -> Result<Option<String>> {
        let mut claims = self.claims.write().await;
        match claims.get(key) {
            Some(existing) if existing != holder => Ok(Some(existing.clone())),
            _ => {
                claims.insert(key.to_string(), holder.to_string());
                Ok(None)
            }
        }
    }

    async fn replace(&self, key: &str, stale: &str, holder: &str) -> Result<bool> {
        let mut claims = self.claims.write().await;
        match claims.get_mut(key) {
            Some(existing) if existing == stale => {
                *existing = holder.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut claims = self.claims.write().await;
        if claims.get(key).is_some_and(|existing| existing == holder) {
            claims.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
