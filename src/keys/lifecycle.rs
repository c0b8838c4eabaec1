use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;

use super::model::{
    DigitalKey, KeyAction, KeyStatus, KeyType, KeyUsageType, KeyValidation, PermissionLevel,
    TrackKeyRequest,
};
use crate::audit::{AuditTrail, EntityType, KeyUsageRecord};
use crate::config::UsageConfig;
use crate::dispatch::SideEffects;
use crate::error::{Error, Result};
use crate::gateway::{Collaborators, NotificationTemplate};
use crate::store::Storage;
use crate::validation;
use crate::vehicle::{OwnerAccount, Vehicle};

pub(crate) fn key_lock(key_id: &str) -> String {
    format!("key:{}", key_id)
}

/// Creates digital keys and drives them through
/// `ACTIVE <-> SUSPENDED -> {TERMINATED, EXPIRED}`.
pub struct KeyLifecycleManager {
    storage: Storage,
    collaborators: Collaborators,
    audit: Arc<AuditTrail>,
    effects: Arc<SideEffects>,
    usage: UsageConfig,
}

impl KeyLifecycleManager {
    pub fn new(
        storage: Storage,
        collaborators: Collaborators,
        audit: Arc<AuditTrail>,
        effects: Arc<SideEffects>,
        usage: UsageConfig,
    ) -> Self {
        Self {
            storage,
            collaborators,
            audit,
            effects,
            usage,
        }
    }

    /// Starts tracking a key. Tracking an id that already exists for the
    /// same vehicle returns the stored key unchanged.
    pub async fn track(&self, request: TrackKeyRequest) -> Result<DigitalKey> {
        validation::validate_key_id(&request.key_id)?;
        validation::validate_vin(&request.vin)?;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&request.vin).await;
        self.track_locked(request).await
    }

    /// `track` for callers already holding the vehicle lock.
    pub(crate) async fn track_locked(&self, request: TrackKeyRequest) -> Result<DigitalKey> {
        validation::validate_key_id(&request.key_id)?;
        validation::validate_vin(&request.vin)?;
        validation::validate_device(&request.device_id, &request.device_oem)?;
        if request.key_type == KeyType::Friend {
            match request.friend_email.as_deref() {
                Some(email) if !email.trim().is_empty() => validation::validate_email(email)?,
                _ => {
                    return Err(Error::Validation(
                        "Friend email is required for friend keys".to_string(),
                    ));
                }
            }
        }
        if request.max_usage_count == Some(0) {
            return Err(Error::Validation(
                "Maximum usage count must be at least 1".to_string(),
            ));
        }

        if let Some(existing) = self.storage.keys.get(&request.key_id).await? {
            return self.existing_key(existing, &request.vin);
        }

        let now = Utc::now();
        let mut vehicle = self.vehicle(&request.vin).await?;
        validation::validate_subscription(&vehicle, now)?;
        if request.key_type == KeyType::Friend && !vehicle.can_create_friend_keys_at(now) {
            return Err(Error::Validation(
                "Friend keys are not allowed for this subscription tier".to_string(),
            ));
        }
        validation::validate_key_capacity(&vehicle)?;
        let owner = self.owner(&vehicle).await?;
        validation::validate_owner(&owner, now)?;

        let expires_at = match request.expires_at {
            Some(at) => {
                validation::validate_key_expiry(&vehicle, at, now)?;
                at
            }
            None => now + vehicle.subscription_tier.key_lifetime(),
        };
        let permission_level = request.permission_level.unwrap_or(match request.key_type {
            KeyType::Owner => PermissionLevel::FullAccess,
            KeyType::Friend => PermissionLevel::DriveOnly,
        });

        let key = DigitalKey {
            key_id: request.key_id.clone(),
            vin: vehicle.vin.clone(),
            device_id: request.device_id.trim().to_string(),
            device_oem: request.device_oem.trim().to_string(),
            key_type: request.key_type,
            status: KeyStatus::Active,
            permission_level,
            public_key: request.public_key,
            friend_email: request.friend_email,
            friend_name: request.friend_name,
            usage_count: 0,
            max_usage_count: request.max_usage_count,
            valid_from: now,
            expires_at: Some(expires_at),
            restrictions: request.restrictions,
            revocation: None,
            last_used_at: None,
            activated_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        if !self.storage.keys.insert_if_absent(&key.key_id, key.clone()).await? {
            let existing = self.key(&key.key_id).await?;
            return self.existing_key(existing, &request.vin);
        }
        vehicle.increment_key_count();
        self.storage.vehicles.put(&vehicle.vin, vehicle.clone()).await?;

        info!(
            "Tracked {:?} key {} for {} ({}/{} keys)",
            key.key_type, key.key_id, vehicle.vin, vehicle.current_key_count, vehicle.max_keys_allowed
        );

        self.collaborators.register_key(
            &self.effects,
            &key.key_id,
            &key.vin,
            &key.device_id,
            key.key_type,
        );
        self.collaborators.notify(
            &self.effects,
            &owner.email,
            NotificationTemplate::KeyCreated,
            json!({
                "keyId": key.key_id,
                "vin": key.vin,
                "keyType": key.key_type,
                "deviceOem": key.device_oem,
                "expiresAt": key.expires_at,
            }),
        );
        self.audit
            .key_action(
                &key.key_id,
                "TRACK_KEY",
                &request.requested_by,
                &format!("Key tracked for vehicle {}", vehicle.vin),
            )
            .await;

        Ok(key)
    }

    fn existing_key(&self, existing: DigitalKey, vin: &str) -> Result<DigitalKey> {
        if existing.vin != vin {
            return Err(Error::StateConflict(format!(
                "key {} is already tracked for another vehicle",
                existing.key_id
            )));
        }
        info!("Key {} already tracked", existing.key_id);
        Ok(existing)
    }

    pub async fn manage(
        &self,
        key_id: &str,
        action: KeyAction,
        reason: &str,
        requested_by: &str,
    ) -> Result<DigitalKey> {
        let vin = self.key(key_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _key_guard = self.storage.locks.lock(&key_lock(key_id)).await;
        self.manage_locked(key_id, action, reason, requested_by).await
    }

    /// `manage` for callers already holding the vehicle and key locks.
    pub(crate) async fn manage_locked(
        &self,
        key_id: &str,
        action: KeyAction,
        reason: &str,
        requested_by: &str,
    ) -> Result<DigitalKey> {
        let now = Utc::now();
        let mut key = self.key(key_id).await?;
        check_transition(&key, action, now)?;

        let mut vehicle = self.vehicle(&key.vin).await?;
        if matches!(action, KeyAction::Suspend | KeyAction::Resume) {
            validation::validate_subscription(&vehicle, now)?;
        }

        match action {
            KeyAction::Suspend => key.status = KeyStatus::Suspended,
            KeyAction::Resume => key.status = KeyStatus::Active,
            KeyAction::Terminate => key.revoke(requested_by, reason, now),
            KeyAction::Expire => {
                key.status = KeyStatus::Expired;
                key.expires_at = Some(now);
            }
        }
        key.updated_at = now;

        self.storage.keys.put(&key.key_id, key.clone()).await?;
        if action == KeyAction::Terminate {
            vehicle.decrement_key_count();
            self.storage.vehicles.put(&vehicle.vin, vehicle.clone()).await?;
        }
        info!("Key {} {} -> {:?}", key.key_id, action, key.status);

        self.collaborators
            .send_command(&self.effects, &key.vin, action.as_str(), &key.key_id);
        self.collaborators
            .update_key_status(&self.effects, &key.key_id, key.status);
        if let Ok(owner) = self.owner(&vehicle).await {
            self.collaborators.notify(
                &self.effects,
                &owner.email,
                NotificationTemplate::KeyStatusChanged,
                json!({ "keyId": key.key_id, "action": action, "status": key.status }),
            );
        }
        self.audit
            .key_action(
                &key.key_id,
                &format!("MANAGE_KEY_{}", action),
                requested_by,
                reason,
            )
            .await;

        Ok(key)
    }

    /// Records one use of a usable key. Reaching the usage cap expires it.
    pub async fn record_usage(&self, key_id: &str, usage_type: KeyUsageType) -> Result<DigitalKey> {
        let vin = self.key(key_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _key_guard = self.storage.locks.lock(&key_lock(key_id)).await;

        let now = Utc::now();
        let mut key = self.key(key_id).await?;
        if let Some(reason) = key.unusable_reason(now) {
            return Err(Error::StateConflict(format!(
                "key {} cannot be used: {}",
                key_id, reason
            )));
        }
        let mut vehicle = self.vehicle(&key.vin).await?;
        validation::validate_subscription(&vehicle, now)?;

        key.record_use(now);
        vehicle.record_key_usage(now);
        self.storage.keys.put(&key.key_id, key.clone()).await?;
        self.storage.vehicles.put(&vin, vehicle).await?;

        self.audit
            .log_key_usage(KeyUsageRecord {
                key_id: key.key_id.clone(),
                vin: key.vin.clone(),
                device_id: key.device_id.clone(),
                usage_type,
                success: true,
                error: None,
                at: now,
            })
            .await;

        if key.status == KeyStatus::Expired {
            info!("Key {} reached its usage limit", key.key_id);
            self.collaborators
                .update_key_status(&self.effects, &key.key_id, key.status);
            self.audit
                .key_action(&key.key_id, "USAGE_LIMIT_REACHED", "SYSTEM", "Key expired after final use")
                .await;
        }
        self.check_suspicious_activity(&key, usage_type, now).await;

        Ok(key)
    }

    async fn check_suspicious_activity(&self, key: &DigitalKey, usage_type: KeyUsageType, now: DateTime<Utc>) {
        let recent = self
            .audit
            .usage_count_since(&key.key_id, now - Duration::hours(24))
            .await;
        if recent > self.usage.suspicious_daily_threshold {
            self.audit
                .security_event(
                    EntityType::DigitalKey,
                    &key.key_id,
                    "SUSPICIOUS_USAGE",
                    "SYSTEM",
                    &format!("High usage count: {} uses in 24 hours", recent),
                )
                .await;
        }
        match usage_type {
            KeyUsageType::EmergencyAccess => {
                self.audit
                    .security_event(
                        EntityType::DigitalKey,
                        &key.key_id,
                        "EMERGENCY_ACCESS",
                        "SYSTEM",
                        "Emergency access used",
                    )
                    .await;
            }
            KeyUsageType::PanicButton => {
                self.audit
                    .critical_event(
                        EntityType::DigitalKey,
                        &key.key_id,
                        "PANIC_BUTTON",
                        "SYSTEM",
                        "Panic button activated",
                    )
                    .await;
            }
            _ => {}
        }
    }

    /// Logs a failed use attempt. Never fails the caller.
    pub async fn record_failed_usage(&self, key_id: &str, usage_type: KeyUsageType, error: &str) {
        let key = match self.storage.keys.get(key_id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("Failed usage reported for unknown key {}", key_id);
                return;
            }
            Err(e) => {
                warn!("Could not record failed usage of {}: {}", key_id, e);
                return;
            }
        };
        self.audit
            .log_key_usage(KeyUsageRecord {
                key_id: key.key_id.clone(),
                vin: key.vin.clone(),
                device_id: key.device_id.clone(),
                usage_type,
                success: false,
                error: Some(error.to_string()),
                at: Utc::now(),
            })
            .await;
        self.audit
            .security_event(
                EntityType::DigitalKey,
                key_id,
                "FAILED_USAGE",
                "SYSTEM",
                &format!("Failed key usage: {:?} - {}", usage_type, error),
            )
            .await;
    }

    pub async fn validate(&self, key_id: &str) -> Result<KeyValidation> {
        let key = self.key(key_id).await?;
        let reason = key.unusable_reason(Utc::now());
        Ok(KeyValidation {
            key_id: key.key_id.clone(),
            valid: reason.is_none(),
            status: key.status,
            reason,
            remaining_uses: key.remaining_uses(),
            expires_at: key.expires_at,
        })
    }

    pub async fn key(&self, key_id: &str) -> Result<DigitalKey> {
        self.storage
            .keys
            .get(key_id)
            .await?
            .ok_or_else(|| Error::not_found("digital key", key_id))
    }

    pub async fn keys_for_vehicle(&self, vin: &str) -> Result<Vec<DigitalKey>> {
        let mut keys: Vec<DigitalKey> = self
            .storage
            .keys
            .values()
            .await?
            .into_iter()
            .filter(|k| k.vin == vin)
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    async fn vehicle(&self, vin: &str) -> Result<Vehicle> {
        self.storage
            .vehicles
            .get(vin)
            .await?
            .ok_or_else(|| Error::not_found("vehicle", vin))
    }

    async fn owner(&self, vehicle: &Vehicle) -> Result<OwnerAccount> {
        self.storage
            .owners
            .get(&vehicle.owner_id)
            .await?
            .ok_or_else(|| Error::not_found("owner account", vehicle.owner_id.clone()))
    }
}

fn check_transition(key: &DigitalKey, action: KeyAction, now: DateTime<Utc>) -> Result<()> {
    let conflict = |message: &str| -> Result<()> {
        Err(Error::StateConflict(format!("{} ({})", message, key.key_id)))
    };
    match action {
        KeyAction::Suspend if key.status != KeyStatus::Active => conflict("Can only suspend active keys"),
        KeyAction::Resume if key.status != KeyStatus::Suspended => {
            conflict("Can only resume suspended keys")
        }
        KeyAction::Resume if key.is_expired_at(now) => conflict("Cannot resume expired key"),
        KeyAction::Resume if key.is_usage_limit_reached() => {
            conflict("Cannot resume key whose usage limit is reached")
        }
        KeyAction::Terminate if key.status == KeyStatus::Terminated => {
            conflict("Key is already terminated")
        }
        KeyAction::Expire if matches!(key.status, KeyStatus::Expired | KeyStatus::Terminated) => {
            conflict("Key is already expired or terminated")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::gateway::{InMemoryKeyRegistry, RecordingNotifier, SimulatedTelematics};
    use crate::vehicle::SubscriptionTier;
    use tokio_test::{assert_err, assert_ok};

    const VIN: &str = "1HGCM82633A004352";

    struct Fixture {
        manager: KeyLifecycleManager,
        storage: Storage,
        audit: Arc<AuditTrail>,
        effects: Arc<SideEffects>,
        registry: Arc<InMemoryKeyRegistry>,
    }

    async fn fixture(tier: SubscriptionTier) -> Fixture {
        let storage = Storage::in_memory();
        storage
            .owners
            .put("OWNER001", OwnerAccount::new("OWNER001", "owner@example.com"))
            .await
            .unwrap();
        storage
            .vehicles
            .put(VIN, Vehicle::new(VIN, "OWNER001", tier))
            .await
            .unwrap();
        let registry = Arc::new(InMemoryKeyRegistry::new());
        let collaborators = Collaborators {
            telematics: Arc::new(SimulatedTelematics::default()),
            registry: registry.clone(),
            notifier: Arc::new(RecordingNotifier::new()),
        };
        let audit = Arc::new(AuditTrail::new());
        let effects = Arc::new(SideEffects::new(RetryConfig {
            max_attempts: 3,
            backoff_ms: 0,
        }));
        let manager = KeyLifecycleManager::new(
            storage.clone(),
            collaborators,
            audit.clone(),
            effects.clone(),
            UsageConfig::default(),
        );
        Fixture {
            manager,
            storage,
            audit,
            effects,
            registry,
        }
    }

    async fn key_count(storage: &Storage) -> u32 {
        storage.vehicles.get(VIN).await.unwrap().unwrap().current_key_count
    }

    #[tokio::test]
    async fn track_creates_active_owner_key() {
        let f = fixture(SubscriptionTier::Premium).await;
        let key = f
            .manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await
            .unwrap();

        assert_eq!(key.status, KeyStatus::Active);
        assert_eq!(key.permission_level, PermissionLevel::FullAccess);
        assert_eq!(key.expires_at, Some(key.valid_from + Duration::days(90)));
        assert_eq!(key_count(&f.storage).await, 1);

        f.effects.drain().await;
        assert!(f.registry.entry("KEY-0000000001").await.is_some());
    }

    #[tokio::test]
    async fn track_is_idempotent() {
        let f = fixture(SubscriptionTier::Premium).await;
        let request = TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple");
        let first = f.manager.track(request.clone()).await.unwrap();
        let second = f.manager.track(request).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(key_count(&f.storage).await, 1);
    }

    #[tokio::test]
    async fn track_enforces_policy() {
        let f = fixture(SubscriptionTier::Basic).await;

        let mut friend = TrackKeyRequest::owner("KEY-FRIEND-01", VIN, "pixel-8", "Google");
        friend.key_type = KeyType::Friend;
        friend.friend_email = Some("friend@example.com".to_string());
        assert!(matches!(f.manager.track(friend).await, Err(Error::Validation(_))));

        let mut too_long = TrackKeyRequest::owner("KEY-0000000002", VIN, "iphone-15", "Apple");
        too_long.expires_at = Some(Utc::now() + Duration::days(31));
        assert!(matches!(f.manager.track(too_long).await, Err(Error::Validation(_))));

        for i in 0..5 {
            assert_ok!(
                f.manager
                    .track(TrackKeyRequest::owner(&format!("KEY-000000010{}", i), VIN, "iphone-15", "Apple"))
                    .await
            );
        }
        let over_cap = f
            .manager
            .track(TrackKeyRequest::owner("KEY-0000000200", VIN, "iphone-15", "Apple"))
            .await;
        assert!(matches!(over_cap, Err(Error::Validation(_))));
        assert_eq!(key_count(&f.storage).await, 5);
    }

    #[tokio::test]
    async fn unverified_owner_cannot_receive_keys() {
        let f = fixture(SubscriptionTier::Premium).await;
        let mut owner = OwnerAccount::new("OWNER001", "owner@example.com");
        owner.email_verified = false;
        f.storage.owners.put("OWNER001", owner).await.unwrap();

        let result = f
            .manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(key_count(&f.storage).await, 0);
    }

    #[tokio::test]
    async fn transition_guards() {
        let f = fixture(SubscriptionTier::Premium).await;
        f.manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await
            .unwrap();

        let suspended = f
            .manager
            .manage("KEY-0000000001", KeyAction::Suspend, "travel", "owner")
            .await
            .unwrap();
        assert_eq!(suspended.status, KeyStatus::Suspended);
        assert!(matches!(
            f.manager.manage("KEY-0000000001", KeyAction::Suspend, "again", "owner").await,
            Err(Error::StateConflict(_))
        ));

        let resumed = f
            .manager
            .manage("KEY-0000000001", KeyAction::Resume, "back", "owner")
            .await
            .unwrap();
        assert_eq!(resumed.status, KeyStatus::Active);

        f.manager
            .manage("KEY-0000000001", KeyAction::Expire, "policy", "SYSTEM")
            .await
            .unwrap();
        assert!(matches!(
            f.manager.manage("KEY-0000000001", KeyAction::Resume, "try", "owner").await,
            Err(Error::StateConflict(_))
        ));

        let terminated = f
            .manager
            .manage("KEY-0000000001", KeyAction::Terminate, "lost phone", "owner")
            .await
            .unwrap();
        assert_eq!(terminated.status, KeyStatus::Terminated);
        assert_eq!(terminated.revocation.as_ref().unwrap().reason, "lost phone");
        assert_eq!(key_count(&f.storage).await, 0);
        assert_err!(
            f.manager
                .manage("KEY-0000000001", KeyAction::Resume, "try", "owner")
                .await
        );
        assert_err!(
            f.manager
                .manage("KEY-0000000001", KeyAction::Terminate, "twice", "owner")
                .await
        );
        assert_eq!(key_count(&f.storage).await, 0);
    }

    #[tokio::test]
    async fn terminate_allowed_after_subscription_lapses() {
        let f = fixture(SubscriptionTier::Premium).await;
        f.manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await
            .unwrap();
        let mut vehicle = f.storage.vehicles.get(VIN).await.unwrap().unwrap();
        vehicle.subscription_active = false;
        f.storage.vehicles.put(VIN, vehicle).await.unwrap();

        assert!(matches!(
            f.manager.manage("KEY-0000000001", KeyAction::Suspend, "x", "owner").await,
            Err(Error::Validation(_))
        ));
        assert_ok!(
            f.manager
                .manage("KEY-0000000001", KeyAction::Terminate, "sold car", "owner")
                .await
        );
    }

    #[tokio::test]
    async fn usage_exhaustion() {
        let f = fixture(SubscriptionTier::Premium).await;
        let mut request = TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple");
        request.max_usage_count = Some(3);
        f.manager.track(request).await.unwrap();

        for expected in [KeyStatus::Active, KeyStatus::Active, KeyStatus::Expired] {
            let key = f
                .manager
                .record_usage("KEY-0000000001", KeyUsageType::Unlock)
                .await
                .unwrap();
            assert_eq!(key.status, expected);
        }
        assert!(matches!(
            f.manager.record_usage("KEY-0000000001", KeyUsageType::Unlock).await,
            Err(Error::StateConflict(_))
        ));

        let key = f.manager.key("KEY-0000000001").await.unwrap();
        assert_eq!(key.usage_count, 3);
        let vehicle = f.storage.vehicles.get(VIN).await.unwrap().unwrap();
        assert_eq!(vehicle.total_key_usage_count, 3);
        assert!(!f.manager.validate("KEY-0000000001").await.unwrap().valid);
    }

    #[tokio::test]
    async fn suspicious_usage_raises_security_events() {
        let f = fixture(SubscriptionTier::Premium).await;
        f.manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await
            .unwrap();

        f.manager
            .record_usage("KEY-0000000001", KeyUsageType::EmergencyAccess)
            .await
            .unwrap();
        f.manager
            .record_usage("KEY-0000000001", KeyUsageType::PanicButton)
            .await
            .unwrap();
        f.manager
            .record_failed_usage("KEY-0000000001", KeyUsageType::Unlock, "bad signature")
            .await;
        f.manager
            .record_failed_usage("KEY-unknown-01", KeyUsageType::Unlock, "bad signature")
            .await;

        let actions: Vec<String> = f
            .audit
            .security_events()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["EMERGENCY_ACCESS", "PANIC_BUTTON", "FAILED_USAGE"]);
        assert_eq!(f.audit.usage_history("KEY-0000000001").await.len(), 3);
    }

    #[tokio::test]
    async fn validation_reports_reason() {
        let f = fixture(SubscriptionTier::Premium).await;
        f.manager
            .track(TrackKeyRequest::owner("KEY-0000000001", VIN, "iphone-15", "Apple"))
            .await
            .unwrap();
        assert!(f.manager.validate("KEY-0000000001").await.unwrap().valid);

        f.manager
            .manage("KEY-0000000001", KeyAction::Suspend, "travel", "owner")
            .await
            .unwrap();
        let verdict = f.manager.validate("KEY-0000000001").await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.status, KeyStatus::Suspended);
        assert!(matches!(
            f.manager.validate("KEY-missing-01").await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(f.manager.keys_for_vehicle(VIN).await.unwrap().len(), 1);
    }
}
