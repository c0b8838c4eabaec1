use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-id mutual exclusion. Operations that touch a vehicle and one of its
/// entities take the vehicle lock first.
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks.entry(id.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }

    pub async fn lock_vehicle(&self, vin: &str) -> OwnedMutexGuard<()> {
        self.lock(&format!("vehicle:{}", vin)).await
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}
