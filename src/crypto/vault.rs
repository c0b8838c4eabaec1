use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::ecies;
use super::keys::KeyMaterial;
use crate::error::CryptoError;

/// Process-local custody for private keys: the CA signing key, vehicle keys
/// and per-session ephemeral keys. Keys go in, only public halves come out.
pub struct KeyVault {
    keys: Arc<RwLock<HashMap<String, KeyMaterial>>>,
    operations_log: Arc<RwLock<Vec<String>>>,
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyVault {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            operations_log: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Generates a key pair under `key_id`, self-tests it and returns the
    /// SPKI-encoded public key. Replaces any key already stored there.
    pub async fn generate(&self, key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let key = KeyMaterial::generate();
        if !ecies::validate_key_pair(&key) {
            return Err(CryptoError::KeyGeneration(format!(
                "self-test failed for {}",
                key_id
            )));
        }
        let public_key = key.public_key_der()?;
        self.keys.write().await.insert(key_id.to_string(), key);
        self.log_operation(&format!("key generated: {}", key_id)).await;
        Ok(public_key)
    }

    /// Returns the public key under `key_id`, generating the pair on first
    /// use. The check and insert happen under one write lock.
    pub async fn get_or_generate(&self, key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let mut keys = self.keys.write().await;
        if let Some(key) = keys.get(key_id) {
            return key.public_key_der();
        }
        let key = KeyMaterial::generate();
        let public_key = key.public_key_der()?;
        keys.insert(key_id.to_string(), key);
        drop(keys);
        self.log_operation(&format!("key generated on demand: {}", key_id))
            .await;
        Ok(public_key)
    }

    pub async fn store(&self, key_id: &str, key: KeyMaterial) {
        self.keys.write().await.insert(key_id.to_string(), key);
        self.log_operation(&format!("key stored: {}", key_id)).await;
    }

    pub async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.read().await;
        match keys.get(key_id) {
            Some(key) => key.public_key_der(),
            None => Err(key_not_found(key_id)),
        }
    }

    pub async fn sign_with(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.read().await;
        let signature = match keys.get(key_id) {
            Some(key) => key.sign(data)?,
            None => return Err(key_not_found(key_id)),
        };
        drop(keys);
        self.log_operation(&format!("signed with: {}", key_id)).await;
        Ok(signature)
    }

    pub async fn decrypt_with(&self, key_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.read().await;
        let plaintext = match keys.get(key_id) {
            Some(key) => ecies::decrypt(ciphertext, key)?,
            None => return Err(key_not_found(key_id)),
        };
        drop(keys);
        self.log_operation(&format!("decrypted with: {}", key_id)).await;
        Ok(plaintext)
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.keys.read().await.contains_key(key_id)
    }

    pub async fn secure_erase(&self, key_id: &str) -> bool {
        let erased = self.keys.write().await.remove(key_id).is_some();
        if erased {
            debug!("Erased vault key {}", key_id);
            self.log_operation(&format!("key erased: {}", key_id)).await;
        }
        erased
    }

    async fn log_operation(&self, operation: &str) {
        self.operations_log
            .write()
            .await
            .push(operation.to_string());
    }

    pub async fn get_operation_count(&self) -> usize {
        self.operations_log.read().await.len()
    }
}

fn key_not_found(key_id: &str) -> CryptoError {
    CryptoError::InvalidKey(format!("no key stored under {}", key_id))
}
