use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::keys::KeyUsageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    DigitalKey,
    Vehicle,
    PairingSession,
    Invitation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: String,
    pub performed_by: String,
    pub reason: String,
    pub severity: AuditSeverity,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUsageRecord {
    pub key_id: String,
    pub vin: String,
    pub device_id: String,
    pub usage_type: KeyUsageType,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only record of who did what to which key, vehicle, session or
/// invitation, plus the per-key usage log.
#[derive(Default)]
pub struct AuditTrail {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    usage: Arc<RwLock<Vec<KeyUsageRecord>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn key_action(&self, key_id: &str, action: &str, by: &str, reason: &str) {
        self.record(EntityType::DigitalKey, key_id, action, by, reason, AuditSeverity::Info)
            .await;
    }

    pub async fn vehicle_action(&self, vin: &str, action: &str, by: &str, reason: &str) {
        self.record(EntityType::Vehicle, vin, action, by, reason, AuditSeverity::Info)
            .await;
    }

    pub async fn invitation_action(&self, invitation_code: &str, action: &str, by: &str, reason: &str) {
        self.record(
            EntityType::Invitation,
            invitation_code,
            action,
            by,
            reason,
            AuditSeverity::Info,
        )
        .await;
    }

    pub async fn security_event(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: &str,
        by: &str,
        reason: &str,
    ) {
        self.record(entity_type, entity_id, action, by, reason, AuditSeverity::Warning)
            .await;
    }

    pub async fn critical_event(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: &str,
        by: &str,
        reason: &str,
    ) {
        self.record(entity_type, entity_id, action, by, reason, AuditSeverity::Critical)
            .await;
    }

    async fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        action: &str,
        by: &str,
        reason: &str,
        severity: AuditSeverity,
    ) {
        match severity {
            AuditSeverity::Info => info!("AUDIT {:?} {} {} by {}", entity_type, entity_id, action, by),
            AuditSeverity::Warning => warn!(
                "SECURITY {:?} {} {} by {}: {}",
                entity_type, entity_id, action, by, reason
            ),
            AuditSeverity::Critical => error!(
                "CRITICAL {:?} {} {} by {}: {}",
                entity_type, entity_id, action, by, reason
            ),
        }
        self.entries.write().await.push(AuditEntry {
            entity_type,
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            performed_by: by.to_string(),
            reason: reason.to_string(),
            severity,
            at: Utc::now(),
        });
    }

    pub async fn log_key_usage(&self, record: KeyUsageRecord) {
        self.usage.write().await.push(record);
    }

    /// Successful uses of `key_id` at or after `since`.
    pub async fn usage_count_since(&self, key_id: &str, since: DateTime<Utc>) -> u64 {
        self.usage
            .read()
            .await
            .iter()
            .filter(|r| r.key_id == key_id && r.success && r.at >= since)
            .count() as u64
    }

    pub async fn usage_history(&self, key_id: &str) -> Vec<KeyUsageRecord> {
        self.usage
            .read()
            .await
            .iter()
            .filter(|r| r.key_id == key_id)
            .cloned()
            .collect()
    }

    pub async fn history(&self, entity_type: EntityType, entity_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub async fn security_events(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.severity != AuditSeverity::Info)
            .cloned()
            .collect()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}
