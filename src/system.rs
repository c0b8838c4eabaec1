use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;

use crate::audit::AuditTrail;
use crate::config::ServiceConfig;
use crate::crypto::KeyVault;
use crate::dispatch::SideEffects;
use crate::error::Result;
use crate::gateway::{Collaborators, InMemoryKeyRegistry, RecordingNotifier, SimulatedTelematics};
use crate::keys::KeyLifecycleManager;
use crate::pairing::PairingSessionManager;
use crate::pki::CertificateAuthority;
use crate::sharing::KeySharingManager;
use crate::store::Storage;
use crate::validation;
use crate::vehicle::{OnBoardUnit, OwnerAccount, Vehicle};

/// The whole key service wired together once at start-up.
pub struct DigitalKeyPlatform {
    pub config: ServiceConfig,
    pub storage: Storage,
    pub vault: Arc<KeyVault>,
    pub ca: Arc<CertificateAuthority>,
    pub pairing: Arc<PairingSessionManager>,
    pub keys: Arc<KeyLifecycleManager>,
    pub sharing: Arc<KeySharingManager>,
    pub audit: Arc<AuditTrail>,
    pub effects: Arc<SideEffects>,
    started_at: DateTime<Utc>,
}

impl DigitalKeyPlatform {
    pub fn new(config: ServiceConfig, storage: Storage, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let vault = Arc::new(KeyVault::new());
        let audit = Arc::new(AuditTrail::new());
        let effects = Arc::new(SideEffects::new(config.registry.clone()));
        let ca = Arc::new(CertificateAuthority::new(&config.certificates, vault.clone()));

        let pairing = Arc::new(PairingSessionManager::new(
            storage.clone(),
            collaborators.clone(),
            ca.clone(),
            vault.clone(),
            audit.clone(),
            effects.clone(),
            config.pairing.clone(),
        ));
        let keys = Arc::new(KeyLifecycleManager::new(
            storage.clone(),
            collaborators.clone(),
            audit.clone(),
            effects.clone(),
            config.usage.clone(),
        ));
        let sharing = Arc::new(KeySharingManager::new(
            storage.clone(),
            collaborators,
            keys.clone(),
            audit.clone(),
            effects.clone(),
            config.sharing.clone(),
        ));

        info!("Digital key platform ready (issuer: {})", config.certificates.issuer);
        Ok(Self {
            config,
            storage,
            vault,
            ca,
            pairing,
            keys,
            sharing,
            audit,
            effects,
            started_at: Utc::now(),
        })
    }

    /// In-memory storage and simulated side systems. The returned handles
    /// expose what the simulations observed.
    pub fn simulated(config: ServiceConfig) -> Result<(Self, SimulatedBackends)> {
        let backends = SimulatedBackends::default();
        let platform = Self::new(config, Storage::in_memory(), backends.collaborators())?;
        Ok((platform, backends))
    }

    pub async fn register_owner(&self, account: OwnerAccount) -> Result<()> {
        validation::validate_email(&account.email)?;
        self.storage
            .owners
            .put(&account.account_id.clone(), account)
            .await
    }

    pub async fn register_vehicle(&self, vehicle: Vehicle) -> Result<()> {
        validation::validate_vin(&vehicle.vin)?;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vehicle.vin).await;
        self.storage.vehicles.put(&vehicle.vin.clone(), vehicle).await
    }

    /// Waits for every queued collaborator call.
    pub async fn shutdown(&self) {
        self.effects.drain().await;
        info!(
            "Digital key platform stopped after {}s",
            (Utc::now() - self.started_at).num_seconds()
        );
    }
}

#[derive(Default, Clone)]
pub struct SimulatedBackends {
    pub telematics: Arc<SimulatedTelematics>,
    pub registry: Arc<InMemoryKeyRegistry>,
    pub notifier: Arc<RecordingNotifier>,
}

impl SimulatedBackends {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            telematics: self.telematics.clone(),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Connects a simulated on-board unit for `vin` to the telematics link.
    pub async fn attach_unit(&self, vin: &str) -> Arc<OnBoardUnit> {
        let unit = Arc::new(OnBoardUnit::new(vin));
        self.telematics.register_unit(unit.clone()).await;
        unit
    }
}
