use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Owner,
    Friend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Active,
    Suspended,
    Terminated,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionLevel {
    FullAccess,
    DriveOnly,
    UnlockOnly,
    TrunkOnly,
    EmergencyOnly,
    Valet,
}

impl PermissionLevel {
    pub fn description(&self) -> &'static str {
        match self {
            PermissionLevel::FullAccess => "Full access to all vehicle functions",
            PermissionLevel::DriveOnly => "Can unlock and start vehicle",
            PermissionLevel::UnlockOnly => "Can only unlock vehicle",
            PermissionLevel::TrunkOnly => "Can only access trunk",
            PermissionLevel::EmergencyOnly => "Emergency access only",
            PermissionLevel::Valet => "Valet mode with speed/distance restrictions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsageType {
    Unlock,
    Lock,
    StartEngine,
    StopEngine,
    TrunkAccess,
    PanicButton,
    RemoteStart,
    ClimateControl,
    HornLights,
    ValetMode,
    EmergencyAccess,
}

impl KeyUsageType {
    pub fn description(&self) -> &'static str {
        match self {
            KeyUsageType::Unlock => "Vehicle unlocked",
            KeyUsageType::Lock => "Vehicle locked",
            KeyUsageType::StartEngine => "Engine started",
            KeyUsageType::StopEngine => "Engine stopped",
            KeyUsageType::TrunkAccess => "Trunk accessed",
            KeyUsageType::PanicButton => "Panic button pressed",
            KeyUsageType::RemoteStart => "Remote engine start",
            KeyUsageType::ClimateControl => "Climate control activated",
            KeyUsageType::HornLights => "Horn and lights activated",
            KeyUsageType::ValetMode => "Valet mode activated",
            KeyUsageType::EmergencyAccess => "Emergency access used",
        }
    }
}

/// Lifecycle actions accepted by `KeyLifecycleManager::manage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAction {
    Suspend,
    Resume,
    Terminate,
    Expire,
}

impl KeyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAction::Suspend => "SUSPEND",
            KeyAction::Resume => "RESUME",
            KeyAction::Terminate => "TERMINATE",
            KeyAction::Expire => "EXPIRE",
        }
    }
}

impl fmt::Display for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUSPEND" => Ok(KeyAction::Suspend),
            "RESUME" => Ok(KeyAction::Resume),
            "TERMINATE" => Ok(KeyAction::Terminate),
            "EXPIRE" => Ok(KeyAction::Expire),
            _ => Err(Error::Validation(
                "Invalid action. Must be SUSPEND, RESUME, TERMINATE, or EXPIRE".to_string(),
            )),
        }
    }
}

/// Stored, not enforced here. Both are free-form JSON documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRestrictions {
    pub time: Option<serde_json::Value>,
    pub location: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub by: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitalKey {
    pub key_id: String,
    pub vin: String,
    pub device_id: String,
    pub device_oem: String,
    pub key_type: KeyType,
    pub status: KeyStatus,
    pub permission_level: PermissionLevel,
    pub public_key: Option<String>,
    pub friend_email: Option<String>,
    pub friend_name: Option<String>,
    pub usage_count: u64,
    pub max_usage_count: Option<u64>,
    pub valid_from: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub restrictions: KeyRestrictions,
    pub revocation: Option<Revocation>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DigitalKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn is_within_valid_period(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && self.expires_at.is_none_or(|at| at > now)
    }

    pub fn is_usage_limit_reached(&self) -> bool {
        self.max_usage_count
            .is_some_and(|max| self.usage_count >= max)
    }

    pub fn remaining_uses(&self) -> Option<u64> {
        self.max_usage_count
            .map(|max| max.saturating_sub(self.usage_count))
    }

    /// Every condition is evaluated against `now`; nothing is cached.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.unusable_reason(now).is_none()
    }

    pub fn unusable_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.status != KeyStatus::Active {
            Some(format!("key status is {:?}", self.status))
        } else if self.is_expired_at(now) {
            Some("key has expired".to_string())
        } else if self.is_revoked() {
            Some("key has been revoked".to_string())
        } else if !self.is_within_valid_period(now) {
            Some("key is outside its validity period".to_string())
        } else if self.is_usage_limit_reached() {
            Some("key usage limit reached".to_string())
        } else {
            None
        }
    }

    pub(crate) fn record_use(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used_at = Some(now);
        self.updated_at = now;
        if self.is_usage_limit_reached() {
            self.status = KeyStatus::Expired;
        }
    }

    pub(crate) fn revoke(&mut self, by: &str, reason: &str, now: DateTime<Utc>) {
        self.status = KeyStatus::Terminated;
        self.revocation = Some(Revocation {
            by: by.to_string(),
            reason: reason.to_string(),
            at: now,
        });
        self.updated_at = now;
    }
}

/// Input to `KeyLifecycleManager::track`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackKeyRequest {
    pub key_id: String,
    pub vin: String,
    pub device_id: String,
    pub device_oem: String,
    pub key_type: KeyType,
    pub public_key: Option<String>,
    pub friend_email: Option<String>,
    pub friend_name: Option<String>,
    pub permission_level: Option<PermissionLevel>,
    pub max_usage_count: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restrictions: KeyRestrictions,
    pub requested_by: String,
}

impl TrackKeyRequest {
    pub fn owner(key_id: &str, vin: &str, device_id: &str, device_oem: &str) -> Self {
        Self {
            key_id: key_id.to_string(),
            vin: vin.to_string(),
            device_id: device_id.to_string(),
            device_oem: device_oem.to_string(),
            key_type: KeyType::Owner,
            public_key: None,
            friend_email: None,
            friend_name: None,
            permission_level: None,
            max_usage_count: None,
            expires_at: None,
            restrictions: KeyRestrictions::default(),
            requested_by: "SYSTEM".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValidation {
    pub key_id: String,
    pub valid: bool,
    pub status: KeyStatus,
    pub reason: Option<String>,
    pub remaining_uses: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}
