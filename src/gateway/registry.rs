use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::KeyRegistry;
use crate::keys::{KeyStatus, KeyType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub vin: String,
    pub device_id: String,
    pub key_type: KeyType,
    pub status: KeyStatus,
}

pub struct InMemoryKeyRegistry {
    entries: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    failures_remaining: AtomicU32,
}

impl Default for InMemoryKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` calls fail, to exercise caller retries.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub async fn entry(&self, key_id: &str) -> Option<RegistryEntry> {
        self.entries.read().await.get(key_id).cloned()
    }

    fn check_available(&self) -> Result<(), String> {
        let tripped = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err("key registry unavailable".to_string())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyRegistry for InMemoryKeyRegistry {
    async fn register(
        &self,
        key_id: &str,
        vin: &str,
        device_id: &str,
        key_type: KeyType,
    ) -> Result<(), String> {
        self.check_available()?;
        self.entries.write().await.insert(
            key_id.to_string(),
            RegistryEntry {
                vin: vin.to_string(),
                device_id: device_id.to_string(),
                key_type,
                status: KeyStatus::Active,
            },
        );
        Ok(())
    }

    async fn update_status(&self, key_id: &str, status: KeyStatus) -> Result<(), String> {
        self.check_available()?;
        match self.entries.write().await.get_mut(key_id) {
            Some(entry) => {
                entry.status = status;
                Ok(())
            }
            None => Err(format!("key {} is not registered", key_id)),
        }
    }
}
