//! Side systems the key core talks to. All calls are best-effort: the
//! managers commit their own state first and only log failures here.

pub mod notify;
pub mod registry;
pub mod telematics;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::dispatch::SideEffects;
use crate::keys::{KeyStatus, KeyType};

pub use notify::{Notification, RecordingNotifier};
pub use registry::{InMemoryKeyRegistry, RegistryEntry};
pub use telematics::SimulatedTelematics;

#[async_trait]
pub trait TelematicsChannel: Send + Sync {
    async fn send_command(&self, vin: &str, command: &str, key_id: &str) -> Result<(), String>;
    async fn provision_verifier(
        &self,
        vin: &str,
        verifier: &str,
        session_id: &str,
    ) -> Result<(), String>;
}

/// External key-tracking registry.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn register(
        &self,
        key_id: &str,
        vin: &str,
        device_id: &str,
        key_type: KeyType,
    ) -> Result<(), String>;
    async fn update_status(&self, key_id: &str, status: KeyStatus) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationTemplate {
    KeyCreated,
    KeyStatusChanged,
    FriendKeyInvitation,
    KeyRevoked,
    PermissionUpdated,
    RestrictionsUpdated,
    SecurityAlert,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient: &str,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) -> Result<(), String>;
}

/// The three side systems, bundled for constructor injection. The helper
/// methods submit each call to `SideEffects` and return immediately.
#[derive(Clone)]
pub struct Collaborators {
    pub telematics: Arc<dyn TelematicsChannel>,
    pub registry: Arc<dyn KeyRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub(crate) fn send_command(&self, effects: &SideEffects, vin: &str, command: &str, key_id: &str) {
        let telematics = self.telematics.clone();
        let (vin, command, key_id) = (vin.to_string(), command.to_string(), key_id.to_string());
        effects.spawn(format!("telematics {} for {}", command, key_id), async move {
            telematics.send_command(&vin, &command, &key_id).await
        });
    }

    pub(crate) fn provision_verifier(
        &self,
        effects: &SideEffects,
        vin: &str,
        verifier: &str,
        session_id: &str,
    ) {
        let telematics = self.telematics.clone();
        let (vin, verifier, session_id) =
            (vin.to_string(), verifier.to_string(), session_id.to_string());
        effects.spawn(format!("verifier provisioning for {}", session_id), async move {
            telematics
                .provision_verifier(&vin, &verifier, &session_id)
                .await
        });
    }

    pub(crate) fn register_key(
        &self,
        effects: &SideEffects,
        key_id: &str,
        vin: &str,
        device_id: &str,
        key_type: KeyType,
    ) {
        let registry = self.registry.clone();
        let (key_id, vin, device_id) = (key_id.to_string(), vin.to_string(), device_id.to_string());
        effects.spawn_with_retry(format!("registry registration of {}", key_id), move || {
            let registry = registry.clone();
            let (key_id, vin, device_id) = (key_id.clone(), vin.clone(), device_id.clone());
            async move { registry.register(&key_id, &vin, &device_id, key_type).await }
        });
    }

    pub(crate) fn update_key_status(&self, effects: &SideEffects, key_id: &str, status: KeyStatus) {
        let registry = self.registry.clone();
        let key_id = key_id.to_string();
        effects.spawn_with_retry(format!("registry status update of {}", key_id), move || {
            let registry = registry.clone();
            let key_id = key_id.clone();
            async move { registry.update_status(&key_id, status).await }
        });
    }

    pub(crate) fn notify(
        &self,
        effects: &SideEffects,
        recipient: &str,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) {
        let notifier = self.notifier.clone();
        let recipient = recipient.to_string();
        effects.spawn(format!("{:?} notification", template), async move {
            notifier.notify(&recipient, template, data).await
        });
    }
}
