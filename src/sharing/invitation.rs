use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::{KeyRestrictions, PermissionLevel, Revocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Revoked,
    Expired,
}

/// An owner's offer of a friend key. Turned into exactly one FRIEND
/// `DigitalKey` when accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySharingInvitation {
    pub invitation_code: String,
    pub vin: String,
    pub friend_email: String,
    pub friend_name: Option<String>,
    pub permission_level: PermissionLevel,
    #[serde(default)]
    pub restrictions: KeyRestrictions,
    pub max_usage_count: Option<u64>,
    /// Expiry of the friend key once created.
    pub expires_at: Option<DateTime<Utc>>,
    /// Deadline for accepting the invitation itself.
    pub invitation_expires_at: DateTime<Utc>,
    pub status: InvitationStatus,
    pub linked_key_id: Option<String>,
    pub shared_by: String,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub revocation: Option<Revocation>,
}

impl KeySharingInvitation {
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && !self.is_expired_at(now)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.invitation_expires_at < now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareKeyRequest {
    pub vin: String,
    pub friend_email: String,
    pub friend_name: Option<String>,
    pub permission_level: PermissionLevel,
    #[serde(default)]
    pub restrictions: KeyRestrictions,
    pub max_usage_count: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub shared_by: String,
}

impl ShareKeyRequest {
    pub fn new(vin: &str, friend_email: &str, permission_level: PermissionLevel, shared_by: &str) -> Self {
        Self {
            vin: vin.to_string(),
            friend_email: friend_email.to_string(),
            friend_name: None,
            permission_level,
            restrictions: KeyRestrictions::default(),
            max_usage_count: None,
            expires_at: None,
            shared_by: shared_by.to_string(),
        }
    }
}

pub fn new_invitation_code() -> String {
    format!("INV-{}", uuid_hex(12))
}

pub fn new_friend_key_id() -> String {
    format!("FRIEND-{}", uuid_hex(16))
}

fn uuid_hex(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn generated_identifiers() {
        let code = new_invitation_code();
        assert_eq!(code.len(), 16);
        assert!(code.starts_with("INV-"));
        assert_eq!(code[4..], code[4..].to_ascii_uppercase());

        let key_id = new_friend_key_id();
        assert_eq!(key_id.len(), 23);
        assert!(crate::validation::validate_key_id(&key_id).is_ok());
    }

    #[test]
    fn pending_only_until_deadline() {
        let now = Utc::now();
        let invitation = KeySharingInvitation {
            invitation_code: new_invitation_code(),
            vin: "1HGCM82633A004352".to_string(),
            friend_email: "friend@example.com".to_string(),
            friend_name: None,
            permission_level: PermissionLevel::DriveOnly,
            restrictions: KeyRestrictions::default(),
            max_usage_count: None,
            expires_at: None,
            invitation_expires_at: now + Duration::days(7),
            status: InvitationStatus::Pending,
            linked_key_id: None,
            shared_by: "owner".to_string(),
            created_at: now,
            accepted_at: None,
            revocation: None,
        };
        assert!(invitation.is_pending_at(now));
        assert!(!invitation.is_pending_at(now + Duration::days(8)));
    }
}
