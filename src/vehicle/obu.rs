use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::crypto::verifier_matches;

/// A command the unit accepted over the telematics link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub command: String,
    pub key_id: String,
}

/// Simulated in-vehicle unit. It keeps the pairing verifiers pushed to it
/// so it can check a device's password without ever seeing the password
/// from the backend.
pub struct OnBoardUnit {
    pub vin: String,
    verifiers: Arc<RwLock<HashMap<String, String>>>,
    commands: Arc<RwLock<Vec<ReceivedCommand>>>,
    online: Arc<Mutex<bool>>,
}

impl OnBoardUnit {
    pub fn new(vin: &str) -> Self {
        Self {
            vin: vin.to_string(),
            verifiers: Arc::new(RwLock::new(HashMap::new())),
            commands: Arc::new(RwLock::new(Vec::new())),
            online: Arc::new(Mutex::new(true)),
        }
    }

    pub async fn set_online(&self, online: bool) {
        *self.online.lock().await = online;
    }

    async fn ensure_online(&self) -> Result<(), String> {
        if *self.online.lock().await {
            Ok(())
        } else {
            Err(format!("vehicle {} is offline", self.vin))
        }
    }

    pub async fn store_verifier(&self, session_id: &str, verifier: &str) -> Result<(), String> {
        self.ensure_online().await?;
        self.verifiers
            .write()
            .await
            .insert(session_id.to_string(), verifier.to_string());
        debug!("OBU {} received verifier for {}", self.vin, session_id);
        Ok(())
    }

    /// Checks a password typed on a device against the provisioned verifier.
    pub async fn check_pairing_password(&self, session_id: &str, password: &str) -> bool {
        self.verifiers
            .read()
            .await
            .get(session_id)
            .is_some_and(|verifier| verifier_matches(password, verifier).unwrap_or(false))
    }

    pub async fn execute(&self, command: &str, key_id: &str) -> Result<(), String> {
        self.ensure_online().await?;
        self.commands.write().await.push(ReceivedCommand {
            command: command.to_string(),
            key_id: key_id.to_string(),
        });
        Ok(())
    }

    pub async fn received_commands(&self) -> Vec<ReceivedCommand> {
        self.commands.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_pairing_secret;

    #[tokio::test]
    async fn checks_password_against_verifier() {
        let obu = OnBoardUnit::new("1HGCM82633A004352");
        let secret = generate_pairing_secret().unwrap();
        obu.store_verifier("PAIR-0000000000000001", &secret.verifier)
            .await
            .unwrap();

        assert!(obu.check_pairing_password("PAIR-0000000000000001", &secret.password).await);
        assert!(!obu.check_pairing_password("PAIR-0000000000000001", "wrong-password").await);
        assert!(!obu.check_pairing_password("PAIR-0000000000000002", &secret.password).await);
    }

    #[tokio::test]
    async fn offline_unit_rejects_traffic() {
        let obu = OnBoardUnit::new("1HGCM82633A004352");
        obu.set_online(false).await;
        assert!(obu.execute("SUSPEND", "KEY-0000000001").await.is_err());
        assert!(obu.received_commands().await.is_empty());

        obu.set_online(true).await;
        obu.execute("SUSPEND", "KEY-0000000001").await.unwrap();
        assert_eq!(obu.received_commands().await.len(), 1);
    }
}
