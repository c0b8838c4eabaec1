use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{NotificationTemplate, Notifier};

#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: String,
    pub template: NotificationTemplate,
    pub data: serde_json::Value,
}

/// Notifier that logs and keeps every message instead of sending mail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn sent_to(&self, recipient: &str) -> Vec<Notification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| n.recipient.eq_ignore_ascii_case(recipient))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        recipient: &str,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) -> Result<(), String> {
        info!("Notification {:?} -> {}", template, recipient);
        self.sent.write().await.push(Notification {
            recipient: recipient.to_string(),
            template,
            data,
        });
        Ok(())
    }
}
