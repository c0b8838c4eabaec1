//! Service configuration, loadable from TOML. Every field has a default so an
//! empty file (or no file) yields the production values.
//!
//! ```toml
//! [pairing]
//! session_ttl_minutes = 15
//! max_failed_attempts = 3
//!
//! [sharing]
//! invitation_ttl_days = 7
//!
//! [certificates]
//! issuer = "Vehicle OEM CA"
//! validity_years = 5
//!
//! [registry]
//! max_attempts = 3
//! backoff_ms = 1000
//!
//! [usage]
//! suspicious_daily_threshold = 50
//! ```

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_SESSION_TTL_MINUTES: i64 = 24 * 60;
const MAX_INVITATION_TTL_DAYS: i64 = 365;
const MAX_VALIDITY_YEARS: i64 = 100;
const MAX_REGISTRY_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub sharing: SharingConfig,
    #[serde(default)]
    pub certificates: CertificateConfig,
    #[serde(default)]
    pub registry: RetryConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub session_ttl_minutes: i64,
    pub max_failed_attempts: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: 15,
            max_failed_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    pub invitation_ttl_days: i64,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            invitation_ttl_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub issuer: String,
    pub validity_years: i64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            issuer: "Vehicle OEM CA".to_string(),
            validity_years: 5,
        }
    }
}

/// Retry policy for best-effort collaborator calls (key registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub suspicious_daily_threshold: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            suspicious_daily_threshold: 50,
        }
    }
}

impl ServiceConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|e| Error::Config {
            field: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(content).map_err(|e| Error::Config {
            field: "<toml>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SESSION_TTL_MINUTES).contains(&self.pairing.session_ttl_minutes) {
            return Err(invalid("pairing.session_ttl_minutes", "must be between 1 and 1440"));
        }
        if self.pairing.max_failed_attempts == 0 {
            return Err(invalid("pairing.max_failed_attempts", "must be at least 1"));
        }
        if !(1..=MAX_INVITATION_TTL_DAYS).contains(&self.sharing.invitation_ttl_days) {
            return Err(invalid("sharing.invitation_ttl_days", "must be between 1 and 365"));
        }
        if !(1..=MAX_VALIDITY_YEARS).contains(&self.certificates.validity_years) {
            return Err(invalid("certificates.validity_years", "must be between 1 and 100"));
        }
        if self.certificates.issuer.trim().is_empty() || self.certificates.issuer.contains('|') {
            return Err(invalid(
                "certificates.issuer",
                "must be non-empty and free of '|'",
            ));
        }
        if !(1..=MAX_REGISTRY_ATTEMPTS).contains(&self.registry.max_attempts) {
            return Err(invalid("registry.max_attempts", "must be between 1 and 10"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::Config {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
