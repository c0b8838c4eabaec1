use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::keys::Revocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingStatus {
    Initiated,
    Completed,
    Failed,
    Expired,
    Revoked,
}

impl PairingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PairingStatus::Initiated)
    }
}

/// One device-to-vehicle pairing handshake. The vehicle's ephemeral private
/// key lives in the key vault under `session_id`; only its public half is
/// kept here.
#[derive(Clone, Serialize, Deserialize)]
pub struct PairingSession {
    pub session_id: String,
    pub vin: String,
    pub pairing_password: String,
    pub pairing_verifier: String,
    pub vehicle_public_key: String,
    pub device_id: Option<String>,
    pub device_oem: Option<String>,
    pub device_public_key: Option<String>,
    pub device_certificate: Option<String>,
    pub cross_signed_certificate: Option<String>,
    pub status: PairingStatus,
    pub expires_at: DateTime<Utc>,
    pub failed_attempts: u32,
    pub initiated_by: String,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub revocation: Option<Revocation>,
}

impl PairingSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub(crate) fn transition(&mut self, status: PairingStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

impl fmt::Debug for PairingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingSession")
            .field("session_id", &self.session_id)
            .field("vin", &self.vin)
            .field("pairing_password", &"<redacted>")
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .field("failed_attempts", &self.failed_attempts)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Returned once by `initiate`; the only place the password leaves the core.
#[derive(Clone, Serialize, Deserialize)]
pub struct PairingInitiation {
    pub session_id: String,
    pub pairing_password: String,
    pub vehicle_public_key: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for PairingInitiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingInitiation")
            .field("session_id", &self.session_id)
            .field("pairing_password", &"<redacted>")
            .field("vehicle_public_key", &self.vehicle_public_key)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CompletePairingRequest {
    pub session_id: String,
    pub pairing_password: String,
    pub device_id: String,
    pub device_oem: String,
    pub device_public_key: String,
    pub device_certificate: Option<String>,
}

impl fmt::Debug for CompletePairingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletePairingRequest")
            .field("session_id", &self.session_id)
            .field("pairing_password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("device_oem", &self.device_oem)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingResult {
    pub session_id: String,
    pub status: PairingStatus,
    pub cross_signed_certificate: Option<String>,
    pub vehicle_public_key: String,
    pub completed_at: DateTime<Utc>,
}

/// `PAIR-` followed by 16 uppercase hex digits.
pub fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("PAIR-{}", hex[..16].to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 21);
        assert!(id.starts_with("PAIR-"));
        assert!(id[5..].chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn only_initiated_is_open() {
        assert!(!PairingStatus::Initiated.is_terminal());
        for status in [
            PairingStatus::Completed,
            PairingStatus::Failed,
            PairingStatus::Expired,
            PairingStatus::Revoked,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn debug_never_prints_password() {
        let now = Utc::now();
        let session = PairingSession {
            session_id: new_session_id(),
            vin: "1HGCM82633A004352".to_string(),
            pairing_password: "Abc123Def456Ghi7".to_string(),
            pairing_verifier: "verifier".to_string(),
            vehicle_public_key: "key".to_string(),
            device_id: None,
            device_oem: None,
            device_public_key: None,
            device_certificate: None,
            cross_signed_certificate: None,
            status: PairingStatus::Initiated,
            expires_at: now + Duration::minutes(15),
            failed_attempts: 0,
            initiated_by: "owner".to_string(),
            initiated_at: now,
            completed_at: None,
            updated_at: now,
            revocation: None,
        };
        assert!(!format!("{:?}", session).contains("Abc123Def456Ghi7"));
        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + Duration::minutes(16)));
    }
}
