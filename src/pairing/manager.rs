use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;

use super::session::{
    CompletePairingRequest, PairingInitiation, PairingResult, PairingSession, PairingStatus,
    new_session_id,
};
use crate::audit::{AuditTrail, EntityType};
use crate::config::PairingConfig;
use crate::crypto::keys::{decode_public_key, fingerprint};
use crate::crypto::{KeyVault, generate_pairing_secret, verifier_matches};
use crate::dispatch::SideEffects;
use crate::error::{Error, Result, SecurityViolation};
use crate::gateway::{Collaborators, NotificationTemplate};
use crate::keys::Revocation;
use crate::pki::CertificateAuthority;
use crate::store::Storage;
use crate::validation;
use crate::vehicle::Vehicle;

fn pairing_claim(vin: &str) -> String {
    format!("pairing:{}", vin)
}

fn session_lock(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn vehicle_key_id(vin: &str) -> String {
    format!("vehicle:{}", vin)
}

/// Runs the pairing handshake:
/// `INITIATED -> {COMPLETED, FAILED, EXPIRED, REVOKED}`.
pub struct PairingSessionManager {
    storage: Storage,
    collaborators: Collaborators,
    ca: Arc<CertificateAuthority>,
    vault: Arc<KeyVault>,
    audit: Arc<AuditTrail>,
    effects: Arc<SideEffects>,
    config: PairingConfig,
}

impl PairingSessionManager {
    pub fn new(
        storage: Storage,
        collaborators: Collaborators,
        ca: Arc<CertificateAuthority>,
        vault: Arc<KeyVault>,
        audit: Arc<AuditTrail>,
        effects: Arc<SideEffects>,
        config: PairingConfig,
    ) -> Self {
        Self {
            storage,
            collaborators,
            ca,
            vault,
            audit,
            effects,
            config,
        }
    }

    /// Issues the vehicle certificate that pairing requires and keeps the
    /// vehicle private key in the vault.
    pub async fn provision_vehicle_certificate(&self, vin: &str) -> Result<String> {
        validation::validate_vin(vin)?;
        let _vehicle_guard = self.storage.locks.lock_vehicle(vin).await;
        let mut vehicle = self.vehicle(vin).await?;

        let credential = self.ca.issue_vehicle_certificate(vin).await?;
        self.vault
            .store(&vehicle_key_id(vin), credential.key_pair)
            .await;
        vehicle.public_key_certificate = Some(credential.certificate.clone());
        self.storage.vehicles.put(vin, vehicle).await?;

        self.audit
            .vehicle_action(vin, "CERTIFICATE_ISSUED", "SYSTEM", "Vehicle certificate issued")
            .await;
        Ok(credential.certificate)
    }

    pub async fn initiate(&self, vin: &str, initiated_by: &str) -> Result<PairingInitiation> {
        validation::validate_vin(vin)?;
        let _vehicle_guard = self.storage.locks.lock_vehicle(vin).await;

        let now = Utc::now();
        let mut vehicle = self.vehicle(vin).await?;
        self.check_eligibility(&vehicle, now).await?;

        let session_id = new_session_id();
        self.claim_vehicle(vin, &session_id, now).await?;

        let created = self.create_session(&mut vehicle, &session_id, initiated_by, now).await;
        if created.is_err() {
            self.storage
                .claims
                .release(&pairing_claim(vin), &session_id)
                .await?;
            self.vault.secure_erase(&session_id).await;
        }
        created
    }

    async fn check_eligibility(&self, vehicle: &Vehicle, now: DateTime<Utc>) -> Result<()> {
        if !vehicle.is_active() {
            return Err(Error::StateConflict(
                "Vehicle must be in active status for pairing".to_string(),
            ));
        }
        validation::validate_subscription(vehicle, now)?;
        if vehicle.public_key_certificate.is_none() {
            return Err(Error::StateConflict(
                "Vehicle public key certificate is required for pairing".to_string(),
            ));
        }
        let owner = self
            .storage
            .owners
            .get(&vehicle.owner_id)
            .await?
            .ok_or_else(|| Error::not_found("owner account", vehicle.owner_id.clone()))?;
        validation::validate_owner(&owner, now)
    }

    /// Takes the per-vehicle pairing claim for `session_id`. A claim left
    /// behind by a session that has since expired is taken over.
    async fn claim_vehicle(&self, vin: &str, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let claim = pairing_claim(vin);
        let Some(holder) = self.storage.claims.claim(&claim, session_id).await? else {
            return Ok(());
        };

        match self.storage.sessions.get(&holder).await? {
            Some(mut existing) if existing.status == PairingStatus::Initiated => {
                if !existing.is_expired_at(now) {
                    return Err(Error::StateConflict(
                        "Vehicle already has an active pairing session".to_string(),
                    ));
                }
                existing.transition(PairingStatus::Expired, now);
                self.vault.secure_erase(&existing.session_id).await;
                self.storage.sessions.put(&holder, existing).await?;
            }
            _ => {}
        }

        if self.storage.claims.replace(&claim, &holder, session_id).await? {
            info!("Pairing claim for {} taken over from {}", vin, holder);
            Ok(())
        } else {
            Err(Error::StateConflict(
                "Vehicle already has an active pairing session".to_string(),
            ))
        }
    }

    async fn create_session(
        &self,
        vehicle: &mut Vehicle,
        session_id: &str,
        initiated_by: &str,
        now: DateTime<Utc>,
    ) -> Result<PairingInitiation> {
        let secret = generate_pairing_secret()?;
        let ephemeral_public = self.vault.generate(session_id).await?;
        let vehicle_public_key = STANDARD.encode(&ephemeral_public);
        let expires_at = now + Duration::minutes(self.config.session_ttl_minutes);

        let session = PairingSession {
            session_id: session_id.to_string(),
            vin: vehicle.vin.clone(),
            pairing_password: secret.password.clone(),
            pairing_verifier: secret.verifier.clone(),
            vehicle_public_key: vehicle_public_key.clone(),
            device_id: None,
            device_oem: None,
            device_public_key: None,
            device_certificate: None,
            cross_signed_certificate: None,
            status: PairingStatus::Initiated,
            expires_at,
            failed_attempts: 0,
            initiated_by: initiated_by.to_string(),
            initiated_at: now,
            completed_at: None,
            updated_at: now,
            revocation: None,
        };
        if !self.storage.sessions.insert_if_absent(session_id, session).await? {
            return Err(Error::Storage(format!("session id collision: {}", session_id)));
        }

        vehicle.pairing_verifier = Some(secret.verifier.clone());
        self.storage.vehicles.put(&vehicle.vin, vehicle.clone()).await?;

        self.collaborators
            .provision_verifier(&self.effects, &vehicle.vin, &secret.verifier, session_id);
        self.audit
            .vehicle_action(
                &vehicle.vin,
                "PAIRING_INITIATED",
                initiated_by,
                "Vehicle pairing session initiated",
            )
            .await;
        info!("Pairing session {} initiated for {}", session_id, vehicle.vin);

        Ok(PairingInitiation {
            session_id: session_id.to_string(),
            pairing_password: secret.password,
            vehicle_public_key,
            expires_at,
        })
    }

    pub async fn complete(&self, request: CompletePairingRequest) -> Result<PairingResult> {
        let vin = self.load(&request.session_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _session_guard = self.storage.locks.lock(&session_lock(&request.session_id)).await;

        let now = Utc::now();
        let mut session = self.load(&request.session_id).await?;
        self.check_open(&mut session, now).await?;

        validation::validate_device(&request.device_id, &request.device_oem)?;
        let device_key = STANDARD
            .decode(request.device_public_key.trim())
            .ok()
            .and_then(|bytes| decode_public_key(&bytes).ok())
            .ok_or_else(|| Error::Validation("device public key is not a P-256 key".to_string()))?;
        if request.pairing_password.trim().is_empty() {
            return Err(Error::Validation("pairing password is required".to_string()));
        }

        if !verifier_matches(&request.pairing_password, &session.pairing_verifier)? {
            return Err(self.record_failed_attempt(session, now).await?);
        }

        let cross_signed_certificate = match request.device_certificate.as_deref() {
            Some(certificate) => {
                check_device_certificate(certificate)?;
                Some(self.ca.cross_sign(certificate).await?)
            }
            None => None,
        };

        session.transition(PairingStatus::Completed, now);
        session.completed_at = Some(now);
        session.device_id = Some(request.device_id.trim().to_string());
        session.device_oem = Some(request.device_oem.trim().to_string());
        session.device_public_key = Some(request.device_public_key.clone());
        session.device_certificate = request.device_certificate.clone();
        session.cross_signed_certificate = cross_signed_certificate.clone();
        self.storage
            .sessions
            .put(&session.session_id, session.clone())
            .await?;
        self.storage
            .claims
            .release(&pairing_claim(&vin), &session.session_id)
            .await?;

        let mut vehicle = self.vehicle(&vin).await?;
        vehicle.last_activity_at = Some(now);
        self.storage.vehicles.put(&vin, vehicle).await?;

        self.audit
            .vehicle_action(
                &vin,
                "PAIRING_COMPLETED",
                &request.device_id,
                "Vehicle pairing completed successfully",
            )
            .await;
        info!(
            "Pairing session {} completed by device {} (key {})",
            session.session_id,
            request.device_id,
            fingerprint(&device_key)
        );

        Ok(PairingResult {
            session_id: session.session_id,
            status: session.status,
            cross_signed_certificate,
            vehicle_public_key: session.vehicle_public_key,
            completed_at: now,
        })
    }

    /// Rejects anything but a live INITIATED session, expiring it on the way
    /// if its deadline has passed.
    async fn check_open(&self, session: &mut PairingSession, now: DateTime<Utc>) -> Result<()> {
        match session.status {
            PairingStatus::Initiated => {}
            PairingStatus::Failed => {
                return Err(SecurityViolation::PairingLocked {
                    session_id: session.session_id.clone(),
                }
                .into());
            }
            status => {
                return Err(Error::StateConflict(format!(
                    "Pairing session {} is not in initiated status ({:?})",
                    session.session_id, status
                )));
            }
        }
        if session.is_expired_at(now) {
            self.close(session, PairingStatus::Expired, now).await?;
            return Err(Error::StateConflict(format!(
                "Pairing session {} has expired",
                session.session_id
            )));
        }
        if session.failed_attempts >= self.config.max_failed_attempts {
            return Err(SecurityViolation::PairingLocked {
                session_id: session.session_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        mut session: PairingSession,
        now: DateTime<Utc>,
    ) -> Result<Error> {
        session.failed_attempts += 1;
        session.updated_at = now;
        warn!(
            "Wrong pairing password for {} (attempt {})",
            session.session_id, session.failed_attempts
        );

        if session.failed_attempts >= self.config.max_failed_attempts {
            self.close(&mut session, PairingStatus::Failed, now).await?;
            self.audit
                .security_event(
                    EntityType::PairingSession,
                    &session.session_id,
                    "PAIRING_LOCKED",
                    "SYSTEM",
                    "Pairing session locked due to failed attempts",
                )
                .await;
            self.alert_owner(&session).await;
            return Ok(SecurityViolation::PairingLocked {
                session_id: session.session_id,
            }
            .into());
        }

        let attempts_remaining = self.config.max_failed_attempts - session.failed_attempts;
        let session_id = session.session_id.clone();
        self.storage.sessions.put(&session_id, session).await?;
        Ok(SecurityViolation::InvalidPairingPassword { attempts_remaining }.into())
    }

    /// Tells the vehicle owner about a locked session. A missing owner record
    /// is logged and does not change the lockout result.
    async fn alert_owner(&self, session: &PairingSession) {
        let owner = match self.vehicle(&session.vin).await {
            Ok(vehicle) => self.storage.owners.get(&vehicle.owner_id).await.ok().flatten(),
            Err(_) => None,
        };
        let Some(owner) = owner else {
            warn!("No owner to alert for locked session {}", session.session_id);
            return;
        };
        self.collaborators.notify(
            &self.effects,
            &owner.email,
            NotificationTemplate::SecurityAlert,
            json!({
                "event": "PAIRING_LOCKED",
                "sessionId": session.session_id,
                "vin": session.vin,
                "failedAttempts": session.failed_attempts,
            }),
        );
    }

    /// Moves a session to a terminal status, frees the vehicle claim and
    /// erases the ephemeral key.
    async fn close(
        &self,
        session: &mut PairingSession,
        status: PairingStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        session.transition(status, now);
        self.storage
            .sessions
            .put(&session.session_id, session.clone())
            .await?;
        self.storage
            .claims
            .release(&pairing_claim(&session.vin), &session.session_id)
            .await?;
        self.vault.secure_erase(&session.session_id).await;
        info!("Pairing session {} closed as {:?}", session.session_id, status);
        Ok(())
    }

    pub async fn revoke(&self, session_id: &str, revoked_by: &str, reason: &str) -> Result<PairingSession> {
        let vin = self.load(session_id).await?.vin;
        let _vehicle_guard = self.storage.locks.lock_vehicle(&vin).await;
        let _session_guard = self.storage.locks.lock(&session_lock(session_id)).await;

        let now = Utc::now();
        let mut session = self.load(session_id).await?;
        if session.status == PairingStatus::Initiated && session.is_expired_at(now) {
            self.close(&mut session, PairingStatus::Expired, now).await?;
        }
        if session.status.is_terminal() {
            return Err(Error::StateConflict(format!(
                "Pairing session {} is already {:?}",
                session_id, session.status
            )));
        }

        session.revocation = Some(Revocation {
            by: revoked_by.to_string(),
            reason: reason.to_string(),
            at: now,
        });
        self.close(&mut session, PairingStatus::Revoked, now).await?;
        self.audit
            .security_event(
                EntityType::PairingSession,
                session_id,
                "PAIRING_REVOKED",
                revoked_by,
                &format!("Pairing session revoked: {}", reason),
            )
            .await;
        Ok(session)
    }

    /// Current view of a session, with lazy expiry applied.
    pub async fn session(&self, session_id: &str) -> Result<PairingSession> {
        let session = self.load(session_id).await?;
        let now = Utc::now();
        if session.status != PairingStatus::Initiated || !session.is_expired_at(now) {
            return Ok(session);
        }

        let _vehicle_guard = self.storage.locks.lock_vehicle(&session.vin).await;
        let _session_guard = self.storage.locks.lock(&session_lock(session_id)).await;
        let mut session = self.load(session_id).await?;
        if session.status == PairingStatus::Initiated && session.is_expired_at(now) {
            self.close(&mut session, PairingStatus::Expired, now).await?;
        }
        Ok(session)
    }

    /// Decrypts a device message sealed to the vehicle ephemeral key of a
    /// completed session.
    pub async fn open_sealed(&self, session_id: &str, sealed_b64: &str) -> Result<Vec<u8>> {
        let session = self.load(session_id).await?;
        if session.status != PairingStatus::Completed {
            return Err(Error::StateConflict(format!(
                "Pairing session {} is not completed",
                session_id
            )));
        }
        let sealed = STANDARD
            .decode(sealed_b64.trim())
            .map_err(|e| Error::Validation(format!("sealed message is not Base64: {}", e)))?;
        match self.vault.decrypt_with(session_id, &sealed).await {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.audit
                    .security_event(
                        EntityType::PairingSession,
                        session_id,
                        "SEALED_MESSAGE_REJECTED",
                        "SYSTEM",
                        &e.to_string(),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    async fn load(&self, session_id: &str) -> Result<PairingSession> {
        self.storage
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::not_found("pairing session", session_id))
    }

    async fn vehicle(&self, vin: &str) -> Result<Vehicle> {
        self.storage
            .vehicles
            .get(vin)
            .await?
            .ok_or_else(|| Error::not_found("vehicle", vin))
    }
}

fn check_device_certificate(certificate: &str) -> Result<()> {
    match STANDARD.decode(certificate.trim()) {
        Ok(bytes) if !bytes.is_empty() => Ok(()),
        Ok(_) => Err(SecurityViolation::InvalidDeviceCertificate(
            "Device certificate is empty".to_string(),
        )
        .into()),
        Err(_) => Err(SecurityViolation::InvalidDeviceCertificate(
            "Device certificate is not valid Base64".to_string(),
        )
        .into()),
    }
}
