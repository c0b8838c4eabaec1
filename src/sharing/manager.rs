use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;

use super::invitation::{
    InvitationStatus, KeySharingInvitation, ShareKeyRequest, new_friend_key_id,
    new_invitation_code,
};
use crate::audit::AuditTrail;
use crate::config::SharingConfig;
use crate::dispatch::SideEffects;
use crate::error::{Error, Result};
use crate::gateway::{Collaborators, NotificationTemplate};
use crate::keys::lifecycle::key_lock;
use crate::keys::{
    DigitalKey, KeyAction, KeyLifecycleManager, KeyRestrictions, KeyStatus, KeyType,
    PermissionLevel, Revocation, TrackKeyRequest,
};
use crate::store::Storage;
use crate::validation;
use crate::vehicle::{OwnerAccount, Vehicle};

fn invitation_claim(vin: &str, friend_email: &str) -> String {
    format!("invite:{}:{}", vin, friend_email.trim().to_ascii_lowercase())
}

/// Owner-to-friend sharing on top of the key lifecycle. Invitations are
/// guarded by the vehicle lock; friend keys by vehicle then key lock.
pub struct KeySharingManager {
    storage: Storage,
    collaborators: Collaborators,
    lifecycle: Arc<KeyLifecycleManager>,
    audit: Arc<AuditTrail>,
    effects: Arc<SideEffects>,
    config: SharingConfig,
}

impl KeySharingManager {
    pub fn new(
        storage: Storage,
        collaborators: Collaborators,
        lifecycle: Arc<KeyLifecycleManager>,
        audit: Arc<AuditTrail>,
        effects: Arc<SideEffects>,
        config: SharingConfig,
    ) -> Self {
        Self {
            storage,
            collaborators,
            lifecycle,
            audit,
            effects,
            config,
        }
    }

    pub async fn share(&self, request: ShareKeyRequest) -> Result<KeySharingInvitation> {
        validation::validate_vin(&request.vin)?;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&request.vin).await;

        let now = Utc::now();
        let vehicle = self.vehicle(&request.vin).await?;
        let owner = self.owner(&vehicle).await?;
        self.check_share(&vehicle, &owner, &request, now)?;

        let friend_email = request.friend_email.trim().to_string();
        let invitation = KeySharingInvitation {
            invitation_code: new_invitation_code(),
            vin: vehicle.vin.clone(),
            friend_email: friend_email.clone(),
            friend_name: request.friend_name,
            permission_level: request.permission_level,
            restrictions: request.restrictions,
            max_usage_count: request.max_usage_count,
            expires_at: request.expires_at,
            invitation_expires_at: now + Duration::days(self.config.invitation_ttl_days),
            status: InvitationStatus::Pending,
            linked_key_id: None,
            shared_by: request.shared_by.clone(),
            created_at: now,
            accepted_at: None,
            revocation: None,
        };

        self.claim_invitation(&invitation, now).await?;
        let inserted = self
            .storage
            .invitations
            .insert_if_absent(&invitation.invitation_code, invitation.clone())
            .await;
        if !matches!(inserted, Ok(true)) {
            self.storage
                .claims
                .release(
                    &invitation_claim(&invitation.vin, &friend_email),
                    &invitation.invitation_code,
                )
                .await?;
            inserted?;
            return Err(Error::Storage(format!(
                "invitation code collision: {}",
                invitation.invitation_code
            )));
        }

        info!(
            "Invitation {} for {} on {} ({:?})",
            invitation.invitation_code, friend_email, vehicle.vin, invitation.permission_level
        );
        self.collaborators.notify(
            &self.effects,
            &friend_email,
            NotificationTemplate::FriendKeyInvitation,
            json!({
                "invitationCode": invitation.invitation_code,
                "friendName": invitation.friend_name,
                "ownerEmail": owner.email,
                "permissionLevel": invitation.permission_level,
                "invitationExpiresAt": invitation.invitation_expires_at,
            }),
        );
        self.audit
            .vehicle_action(
                &vehicle.vin,
                "KEY_SHARING_INVITATION_SENT",
                &request.shared_by,
                &format!("Key sharing invitation sent to {}", friend_email),
            )
            .await;
        self.audit
            .invitation_action(
                &invitation.invitation_code,
                "INVITATION_CREATED",
                &request.shared_by,
                &format!("{:?} access offered", invitation.permission_level),
            )
            .await;

        Ok(invitation)
    }

    fn check_share(
        &self,
        vehicle: &Vehicle,
        owner: &OwnerAccount,
        request: &ShareKeyRequest,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !vehicle.subscription_tier.friend_keys_allowed() {
            return Err(Error::Validation(
                "Friend keys are not allowed for this subscription tier".to_string(),
            ));
        }
        validation::validate_subscription(vehicle, now)?;
        validation::validate_key_capacity(vehicle)?;
        validation::validate_email(&request.friend_email)?;
        if owner.email.eq_ignore_ascii_case(request.friend_email.trim()) {
            return Err(Error::Validation(
                "Cannot share key with vehicle owner".to_string(),
            ));
        }
        if let Some(expires_at) = request.expires_at {
            validation::validate_key_expiry(vehicle, expires_at, now)?;
        }
        if request.max_usage_count == Some(0) {
            return Err(Error::Validation(
                "Maximum usage count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Takes the (vehicle, email) claim, replacing one left by an invitation
    /// that is no longer pending.
    async fn claim_invitation(&self, invitation: &KeySharingInvitation, now: DateTime<Utc>) -> Result<()> {
        let claim = invitation_claim(&invitation.vin, &invitation.friend_email);
        let code = &invitation.invitation_code;
        let Some(holder) = self.storage.claims.claim(&claim, code).await? else {
            return Ok(());
        };

        if let Some(mut existing) = self.storage.invitations.get(&holder).await? {
            if existing.is_pending_at(now) {
                return Err(Error::StateConflict(
                    "Invitation already sent to this email for this vehicle".to_string(),
                ));
            }
            if existing.status == InvitationStatus::Pending {
                existing.status = InvitationStatus::Expired;
                self.storage.invitations.put(&holder, existing).await?;
            }
        }

        if self.storage.claims.replace(&claim, &holder, code).await? {
            Ok(())
        } else {
            Err(Error::StateConflict(
                "Invitation already sent to this email for this vehicle".to_string(),
            ))
        }
    }

    /// Turns a pending invitation into a FRIEND key bound to the accepting
    /// device.
    pub async fn accept(&self, invitation_code: &str, device_id: &str, device_oem: &str) -> Result<DigitalKey> {
        let vin = self.invitation(invitation_code).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;

        let now = Utc::now();
        let mut invitation = self.invitation(invitation_code).await?;
        if invitation.status != InvitationStatus::Pending {
            return Err(Error::StateConflict(format!(
                "Invitation {} is no longer valid ({:?})",
                invitation_code, invitation.status
            )));
        }
        if invitation.is_expired_at(now) {
            self.close(&mut invitation, InvitationStatus::Expired).await?;
            return Err(Error::StateConflict(format!(
                "Invitation {} has expired",
                invitation_code
            )));
        }

        let vehicle = self.vehicle(&vin).await?;
        validation::validate_subscription(&vehicle, now)?;
        validation::validate_key_capacity(&vehicle)?;
        validation::validate_owner(&self.owner(&vehicle).await?, now)?;

        // Persisted as ACCEPTED before the key exists; reverted to PENDING if
        // tracking fails.
        let key_id = new_friend_key_id();
        invitation.status = InvitationStatus::Accepted;
        invitation.accepted_at = Some(now);
        invitation.linked_key_id = Some(key_id.clone());
        self.storage
            .invitations
            .put(invitation_code, invitation.clone())
            .await?;

        let tracked = self
            .lifecycle
            .track_locked(TrackKeyRequest {
                key_id,
                vin: vin.clone(),
                device_id: device_id.to_string(),
                device_oem: device_oem.to_string(),
                key_type: KeyType::Friend,
                public_key: None,
                friend_email: Some(invitation.friend_email.clone()),
                friend_name: invitation.friend_name.clone(),
                permission_level: Some(invitation.permission_level),
                max_usage_count: invitation.max_usage_count,
                expires_at: invitation.expires_at,
                restrictions: invitation.restrictions.clone(),
                requested_by: invitation.friend_email.clone(),
            })
            .await;
        let key = match tracked {
            Ok(key) => key,
            Err(e) => {
                invitation.status = InvitationStatus::Pending;
                invitation.accepted_at = None;
                invitation.linked_key_id = None;
                if let Err(restore) = self.storage.invitations.put(invitation_code, invitation).await {
                    warn!("Invitation {} left accepted without a key: {}", invitation_code, restore);
                }
                return Err(e);
            }
        };
        self.close(&mut invitation, InvitationStatus::Accepted).await?;

        self.audit
            .key_action(
                &key.key_id,
                "FRIEND_KEY_ACCEPTED",
                &invitation.friend_email,
                "Friend key invitation accepted",
            )
            .await;
        Ok(key)
    }

    /// Withdraws a pending invitation before it is accepted.
    pub async fn cancel_invitation(&self, invitation_code: &str, cancelled_by: &str) -> Result<KeySharingInvitation> {
        let vin = self.invitation(invitation_code).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;

        let mut invitation = self.invitation(invitation_code).await?;
        if invitation.status != InvitationStatus::Pending {
            return Err(Error::StateConflict(format!(
                "Invitation {} is no longer pending ({:?})",
                invitation_code, invitation.status
            )));
        }
        invitation.revocation = Some(Revocation {
            by: cancelled_by.to_string(),
            reason: "Invitation cancelled".to_string(),
            at: Utc::now(),
        });
        self.close(&mut invitation, InvitationStatus::Revoked).await?;
        self.audit
            .invitation_action(
                invitation_code,
                "INVITATION_CANCELLED",
                cancelled_by,
                "Pending invitation withdrawn",
            )
            .await;
        Ok(invitation)
    }

    /// Terminates a friend key, frees its slot on the vehicle and marks the
    /// invitation it came from as revoked.
    pub async fn revoke(&self, key_id: &str, revoked_by: &str, reason: &str) -> Result<DigitalKey> {
        let vin = self.friend_key(key_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _key_guard = self.storage.locks.lock(&key_lock(key_id)).await;
        self.friend_key(key_id).await?;

        let key = self
            .lifecycle
            .manage_locked(key_id, KeyAction::Terminate, reason, revoked_by)
            .await?;

        if let Some(mut invitation) = self.invitation_for_key(&vin, key_id).await? {
            invitation.status = InvitationStatus::Revoked;
            invitation.revocation = key.revocation.clone();
            let code = invitation.invitation_code.clone();
            self.storage.invitations.put(&code, invitation).await?;
        }

        self.notify_friend(
            &key,
            NotificationTemplate::KeyRevoked,
            json!({ "keyId": key.key_id, "vin": key.vin, "reason": reason }),
        );
        self.audit
            .key_action(key_id, "FRIEND_KEY_REVOKED", revoked_by, reason)
            .await;
        Ok(key)
    }

    pub async fn update_permissions(
        &self,
        key_id: &str,
        permission_level: PermissionLevel,
        updated_by: &str,
    ) -> Result<DigitalKey> {
        let vin = self.friend_key(key_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _key_guard = self.storage.locks.lock(&key_lock(key_id)).await;

        let mut key = self.friend_key(key_id).await?;
        check_not_terminated(&key)?;
        let previous = key.permission_level;
        key.permission_level = permission_level;
        key.updated_at = Utc::now();
        self.storage.keys.put(key_id, key.clone()).await?;

        self.notify_friend(
            &key,
            NotificationTemplate::PermissionUpdated,
            json!({
                "keyId": key.key_id,
                "vin": key.vin,
                "oldPermissionLevel": previous,
                "newPermissionLevel": permission_level,
            }),
        );
        self.audit
            .key_action(
                key_id,
                "PERMISSION_UPDATED",
                updated_by,
                &format!("Permission changed from {:?} to {:?}", previous, permission_level),
            )
            .await;
        Ok(key)
    }

    /// Replaces the restrictions and usage cap of a friend key. A cap equal
    /// to the uses already made expires the key; a lower one is rejected.
    pub async fn set_restrictions(
        &self,
        key_id: &str,
        restrictions: KeyRestrictions,
        max_usage_count: Option<u64>,
        updated_by: &str,
    ) -> Result<DigitalKey> {
        let vin = self.friend_key(key_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _key_guard = self.storage.locks.lock(&key_lock(key_id)).await;

        let mut key = self.friend_key(key_id).await?;
        check_not_terminated(&key)?;
        if let Some(max) = max_usage_count {
            if max == 0 || max < key.usage_count {
                return Err(Error::Validation(format!(
                    "Maximum usage count {} is below the {} uses already recorded",
                    max, key.usage_count
                )));
            }
        }

        key.restrictions = restrictions;
        key.max_usage_count = max_usage_count;
        key.updated_at = Utc::now();
        let exhausted = key.status != KeyStatus::Expired && key.is_usage_limit_reached();
        if exhausted {
            key.status = KeyStatus::Expired;
        }
        self.storage.keys.put(key_id, key.clone()).await?;

        if exhausted {
            self.collaborators
                .update_key_status(&self.effects, key_id, key.status);
        }
        self.notify_friend(
            &key,
            NotificationTemplate::RestrictionsUpdated,
            json!({ "keyId": key.key_id, "vin": key.vin, "maxUsageCount": key.max_usage_count }),
        );
        self.audit
            .key_action(key_id, "RESTRICTIONS_UPDATED", updated_by, "Key restrictions updated")
            .await;
        Ok(key)
    }

    /// Invitations still open for acceptance, oldest first.
    pub async fn pending_invitations(&self, vin: &str) -> Result<Vec<KeySharingInvitation>> {
        self.vehicle(vin).await?;
        let now = Utc::now();
        let mut pending: Vec<KeySharingInvitation> = self
            .storage
            .invitations
            .values()
            .await?
            .into_iter()
            .filter(|i| i.vin == vin && i.is_pending_at(now))
            .collect();
        pending.sort_by_key(|i| i.created_at);
        Ok(pending)
    }

    pub async fn shared_keys(&self, vin: &str) -> Result<Vec<DigitalKey>> {
        Ok(self
            .lifecycle
            .keys_for_vehicle(vin)
            .await?
            .into_iter()
            .filter(|k| k.key_type == KeyType::Friend)
            .collect())
    }

    pub async fn invitation(&self, invitation_code: &str) -> Result<KeySharingInvitation> {
        self.storage
            .invitations
            .get(invitation_code)
            .await?
            .ok_or_else(|| Error::not_found("invitation", invitation_code))
    }

    async fn close(&self, invitation: &mut KeySharingInvitation, status: InvitationStatus) -> Result<()> {
        invitation.status = status;
        self.storage
            .invitations
            .put(&invitation.invitation_code, invitation.clone())
            .await?;
        self.storage
            .claims
            .release(
                &invitation_claim(&invitation.vin, &invitation.friend_email),
                &invitation.invitation_code,
            )
            .await?;
        Ok(())
    }

    async fn invitation_for_key(&self, vin: &str, key_id: &str) -> Result<Option<KeySharingInvitation>> {
        Ok(self
            .storage
            .invitations
            .values()
            .await?
            .into_iter()
            .find(|i| i.vin == vin && i.linked_key_id.as_deref() == Some(key_id)))
    }

    async fn friend_key(&self, key_id: &str) -> Result<DigitalKey> {
        let key = self.lifecycle.key(key_id).await?;
        if key.key_type != KeyType::Friend {
            return Err(Error::Validation(format!(
                "Key {} is not a friend key",
                key_id
            )));
        }
        Ok(key)
    }

    fn notify_friend(&self, key: &DigitalKey, template: NotificationTemplate, data: serde_json::Value) {
        if let Some(email) = key.friend_email.as_deref() {
            self.collaborators.notify(&self.effects, email, template, data);
        }
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

fn check_not_terminated(key: &DigitalKey) -> Result<()> {
    if key.status == KeyStatus::Terminated {
        return Err(Error::StateConflict(format!(
            "Key {} has been terminated",
            key.key_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, UsageConfig};
    use crate::gateway::{InMemoryKeyRegistry, RecordingNotifier, SimulatedTelematics};
    use crate::keys::KeyUsageType;
    use crate::vehicle::SubscriptionTier;
    use tokio_test::{assert_err, assert_ok};

    const VIN: &str = "1HGCM82633A004352";
    const FRIEND: &str = "friend@example.com";

    struct Fixture {
        sharing: KeySharingManager,
        lifecycle: Arc<KeyLifecycleManager>,
        storage: Storage,
        notifier: Arc<RecordingNotifier>,
        effects: Arc<SideEffects>,
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

        let notifier = Arc::new(RecordingNotifier::new());
        let collaborators = Collaborators {
            telematics: Arc::new(SimulatedTelematics::default()),
            registry: Arc::new(InMemoryKeyRegistry::new()),
            notifier: notifier.clone(),
        };
        let audit = Arc::new(AuditTrail::new());
        let effects = Arc::new(SideEffects::new(RetryConfig {
            max_attempts: 1,
            backoff_ms: 0,
        }));
        let lifecycle = Arc::new(KeyLifecycleManager::new(
            storage.clone(),
            collaborators.clone(),
            audit.clone(),
            effects.clone(),
            UsageConfig::default(),
        ));
        let sharing = KeySharingManager::new(
            storage.clone(),
            collaborators,
            lifecycle.clone(),
            audit,
            effects.clone(),
            SharingConfig::default(),
        );
        Fixture {
            sharing,
            lifecycle,
            storage,
            notifier,
            effects,
        }
    }

    async fn vehicle(storage: &Storage) -> Vehicle {
        storage.vehicles.get(VIN).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn share_and_accept() {
        let f = fixture(SubscriptionTier::Premium).await;
        let invitation = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert_eq!(f.sharing.pending_invitations(VIN).await.unwrap().len(), 1);

        let key = f
            .sharing
            .accept(&invitation.invitation_code, "galaxy-s24", "Samsung")
            .await
            .unwrap();
        assert_eq!(key.key_type, KeyType::Friend);
        assert_eq!(key.permission_level, PermissionLevel::DriveOnly);
        assert_eq!(key.friend_email.as_deref(), Some(FRIEND));
        assert!(key.key_id.starts_with("FRIEND-"));
        assert_eq!(vehicle(&f.storage).await.current_key_count, 1);

        let stored = f.sharing.invitation(&invitation.invitation_code).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Accepted);
        assert_eq!(stored.linked_key_id.as_deref(), Some(key.key_id.as_str()));
        assert!(f.sharing.pending_invitations(VIN).await.unwrap().is_empty());
        assert_eq!(f.sharing.shared_keys(VIN).await.unwrap().len(), 1);

        assert_err!(f.sharing.accept(&invitation.invitation_code, "galaxy-s24", "Samsung").await);

        f.effects.drain().await;
        assert_eq!(f.notifier.sent_to(FRIEND).await.len(), 1);
        assert_eq!(f.notifier.sent_to("owner@example.com").await.len(), 1);
    }

    #[tokio::test]
    async fn one_pending_invitation_per_friend() {
        let f = fixture(SubscriptionTier::Premium).await;
        let first = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        let err = f
            .sharing
            .share(ShareKeyRequest::new(VIN, "Friend@Example.com", PermissionLevel::Valet, "OWNER001"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));

        assert_ok!(f.sharing.cancel_invitation(&first.invitation_code, "OWNER001").await);
        assert_ok!(
            f.sharing
                .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::Valet, "OWNER001"))
                .await
        );
    }

    #[tokio::test]
    async fn expired_invitation_frees_the_slot() {
        let f = fixture(SubscriptionTier::Premium).await;
        let first = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        let mut stale = first.clone();
        stale.invitation_expires_at = Utc::now() - Duration::minutes(1);
        f.storage.invitations.put(&first.invitation_code, stale).await.unwrap();

        assert!(matches!(
            f.sharing.accept(&first.invitation_code, "galaxy-s24", "Samsung").await,
            Err(Error::StateConflict(_))
        ));
        assert_eq!(
            f.sharing.invitation(&first.invitation_code).await.unwrap().status,
            InvitationStatus::Expired
        );
        assert_ok!(
            f.sharing
                .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
                .await
        );
    }

    #[tokio::test]
    async fn share_policy() {
        let basic = fixture(SubscriptionTier::Basic).await;
        assert!(matches!(
            basic
                .sharing
                .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
                .await,
            Err(Error::Validation(_))
        ));

        let f = fixture(SubscriptionTier::Premium).await;
        let to_owner = ShareKeyRequest::new(VIN, "OWNER@example.com", PermissionLevel::DriveOnly, "OWNER001");
        assert!(matches!(f.sharing.share(to_owner).await, Err(Error::Validation(_))));

        let mut too_long = ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001");
        too_long.expires_at = Some(Utc::now() + Duration::days(91));
        assert!(matches!(f.sharing.share(too_long).await, Err(Error::Validation(_))));

        let mut past = ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001");
        past.expires_at = Some(Utc::now() - Duration::days(1));
        assert!(matches!(f.sharing.share(past).await, Err(Error::Validation(_))));

        let bad_email = ShareKeyRequest::new(VIN, "not-an-email", PermissionLevel::DriveOnly, "OWNER001");
        assert!(matches!(f.sharing.share(bad_email).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn accept_rechecks_capacity() {
        let f = fixture(SubscriptionTier::Premium).await;
        let invitation = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        let mut full = vehicle(&f.storage).await;
        full.current_key_count = full.max_keys_allowed;
        f.storage.vehicles.put(VIN, full).await.unwrap();

        assert!(matches!(
            f.sharing.accept(&invitation.invitation_code, "galaxy-s24", "Samsung").await,
            Err(Error::Validation(_))
        ));
        assert_eq!(
            f.sharing.invitation(&invitation.invitation_code).await.unwrap().status,
            InvitationStatus::Pending
        );
    }

    #[tokio::test]
    async fn failed_accept_leaves_invitation_pending() {
        let f = fixture(SubscriptionTier::Premium).await;
        let invitation = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();

        assert!(matches!(
            f.sharing.accept(&invitation.invitation_code, "ab", "Samsung").await,
            Err(Error::Validation(_))
        ));
        let stored = f.sharing.invitation(&invitation.invitation_code).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Pending);
        assert_eq!(stored.linked_key_id, None);
        assert_eq!(stored.accepted_at, None);
        assert_eq!(vehicle(&f.storage).await.current_key_count, 0);
        assert!(f.lifecycle.keys_for_vehicle(VIN).await.unwrap().is_empty());

        let key = f
            .sharing
            .accept(&invitation.invitation_code, "galaxy-s24", "Samsung")
            .await
            .unwrap();
        let stored = f.sharing.invitation(&invitation.invitation_code).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Accepted);
        assert_eq!(stored.linked_key_id.as_deref(), Some(key.key_id.as_str()));
    }

    #[tokio::test]
    async fn revoke_releases_slot_and_invitation() {
        let f = fixture(SubscriptionTier::Premium).await;
        let invitation = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        let key = f
            .sharing
            .accept(&invitation.invitation_code, "galaxy-s24", "Samsung")
            .await
            .unwrap();

        let revoked = f.sharing.revoke(&key.key_id, "OWNER001", "returned car").await.unwrap();
        assert_eq!(revoked.status, KeyStatus::Terminated);
        assert_eq!(vehicle(&f.storage).await.current_key_count, 0);
        assert_eq!(
            f.sharing.invitation(&invitation.invitation_code).await.unwrap().status,
            InvitationStatus::Revoked
        );
        assert!(matches!(
            f.sharing.revoke(&key.key_id, "OWNER001", "again").await,
            Err(Error::StateConflict(_))
        ));

        f.effects.drain().await;
        let friend_mail = f.notifier.sent_to(FRIEND).await;
        assert_eq!(friend_mail.last().unwrap().template, NotificationTemplate::KeyRevoked);
    }

    #[tokio::test]
    async fn owner_keys_are_off_limits() {
        let f = fixture(SubscriptionTier::Premium).await;
        let owner_key = f
            .lifecycle
            .track(TrackKeyRequest::owner("OWNER-KEY-0001", VIN, "iphone-15-pro", "Apple"))
            .await
            .unwrap();
        assert!(matches!(
            f.sharing.revoke(&owner_key.key_id, "OWNER001", "nope").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.sharing
                .update_permissions(&owner_key.key_id, PermissionLevel::Valet, "OWNER001")
                .await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.sharing
                .set_restrictions(&owner_key.key_id, KeyRestrictions::default(), Some(5), "OWNER001")
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn friend_key_administration() {
        let f = fixture(SubscriptionTier::Premium).await;
        let invitation = f
            .sharing
            .share(ShareKeyRequest::new(VIN, FRIEND, PermissionLevel::DriveOnly, "OWNER001"))
            .await
            .unwrap();
        let key = f
            .sharing
            .accept(&invitation.invitation_code, "galaxy-s24", "Samsung")
            .await
            .unwrap();

        let updated = f
            .sharing
            .update_permissions(&key.key_id, PermissionLevel::UnlockOnly, "OWNER001")
            .await
            .unwrap();
        assert_eq!(updated.permission_level, PermissionLevel::UnlockOnly);

        for _ in 0..2 {
            f.lifecycle.record_usage(&key.key_id, KeyUsageType::Unlock).await.unwrap();
        }
        assert!(matches!(
            f.sharing
                .set_restrictions(&key.key_id, KeyRestrictions::default(), Some(1), "OWNER001")
                .await,
            Err(Error::Validation(_))
        ));

        let restrictions = KeyRestrictions {
            time: Some(json!({ "from": "08:00", "to": "20:00" })),
            location: None,
        };
        let capped = f
            .sharing
            .set_restrictions(&key.key_id, restrictions.clone(), Some(2), "OWNER001")
            .await
            .unwrap();
        assert_eq!(capped.restrictions, restrictions);
        assert_eq!(capped.status, KeyStatus::Expired);

        f.effects.drain().await;
        let templates: Vec<_> = f
            .notifier
            .sent_to(FRIEND)
            .await
            .into_iter()
            .map(|n| n.template)
            .collect();
        assert!(templates.contains(&NotificationTemplate::PermissionUpdated));
        assert!(templates.contains(&NotificationTemplate::RestrictionsUpdated));
    }
}
