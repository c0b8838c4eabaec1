//! Persistence seams. Everything is keyed by natural id (VIN, session id,
//! key id, invitation code) and assumed read-your-writes consistent.

pub mod locks;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::keys::DigitalKey;
use crate::pairing::PairingSession;
use crate::sharing::KeySharingInvitation;
use crate::vehicle::{OwnerAccount, Vehicle};

pub use locks::LockTable;
pub use memory::{InMemoryClaimIndex, InMemoryRepository};

#[async_trait]
pub trait Repository<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, id: &str) -> Result<Option<T>>;
    async fn put(&self, id: &str, value: T) -> Result<()>;
    /// Stores `value` only when nothing is stored under `id`; returns
    /// whether it was inserted.
    async fn insert_if_absent(&self, id: &str, value: T) -> Result<bool>;
    async fn values(&self) -> Result<Vec<T>>;
}

/// Atomic uniqueness constraint: at most one holder per claim key.
#[async_trait]
pub trait ClaimIndex: Send + Sync {
    /// Takes `key` for `holder` if it is free. Returns the current holder
    /// when someone else already has it.
    async fn claim(&self, key: &str, holder: &str) -> Result<Option<String>>;

    /// Hands `key` from `stale` to `holder` only if `stale` still holds it.
    async fn replace(&self, key: &str, stale: &str, holder: &str) -> Result<bool>;

    /// Frees `key` if `holder` holds it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool>;
}

/// The repositories the managers share, plus the claim index and lock table.
#[derive(Clone)]
pub struct Storage {
    pub vehicles: Arc<dyn Repository<Vehicle>>,
    pub owners: Arc<dyn Repository<OwnerAccount>>,
    pub sessions: Arc<dyn Repository<PairingSession>>,
    pub keys: Arc<dyn Repository<DigitalKey>>,
    pub invitations: Arc<dyn Repository<KeySharingInvitation>>,
    pub claims: Arc<dyn ClaimIndex>,
    pub locks: Arc<LockTable>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            vehicles: Arc::new(InMemoryRepository::new()),
            owners: Arc::new(InMemoryRepository::new()),
            sessions: Arc::new(InMemoryRepository::new()),
            keys: Arc::new(InMemoryRepository::new()),
            invitations: Arc::new(InMemoryRepository::new()),
            claims: Arc::new(InMemoryClaimIndex::new()),
            locks: Arc::new(LockTable::new()),
        }
    }
}
