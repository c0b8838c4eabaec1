use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{Rng, rngs::OsRng};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

pub const PAIRING_PASSWORD_LEN: usize = 16;

/// One-time pairing password and the verifier provisioned to the vehicle.
pub struct PairingSecret {
    pub password: String,
    pub verifier: String,
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSecret")
            .field("password", &"<redacted>")
            .field("verifier", &self.verifier)
            .finish()
    }
}

pub fn generate_pairing_secret() -> Result<PairingSecret, CryptoError> {
    let password: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(PAIRING_PASSWORD_LEN)
        .map(char::from)
        .collect();
    let verifier = pairing_verifier(&password)?;
    Ok(PairingSecret { password, verifier })
}

/// Base64(SHA-256(password)).
pub fn pairing_verifier(password: &str) -> Result<String, CryptoError> {
    if password.trim().is_empty() {
        return Err(CryptoError::InvalidInput(
            "pairing password cannot be empty".to_string(),
        ));
    }
    Ok(STANDARD.encode(Sha256::digest(password.as_bytes())))
}

/// Checks `password` against a stored verifier without an early-exit
/// comparison. Both digests go through HMAC and the tags are compared with
/// `verify_slice`, which runs in constant time.
pub fn verifier_matches(password: &str, verifier: &str) -> Result<bool, CryptoError> {
    if password.trim().is_empty() {
        return Err(CryptoError::InvalidInput(
            "pairing password cannot be empty".to_string(),
        ));
    }
    let candidate = Sha256::digest(password.as_bytes());
    let Ok(stored) = STANDARD.decode(verifier.trim()) else {
        return Ok(false);
    };

    let tag = verifier_tag(&candidate)?.finalize().into_bytes();
    Ok(verifier_tag(&stored)?.verify_slice(&tag).is_ok())
}

fn verifier_tag(digest: &[u8]) -> Result<Hmac<Sha256>, CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(b"pairing-verifier")
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    mac.update(digest);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn password_shape() {
        let secret = generate_pairing_secret().unwrap();
        assert_eq!(secret.password.len(), PAIRING_PASSWORD_LEN);
        assert!(secret.password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(secret.verifier, pairing_verifier(&secret.password).unwrap());
    }

    #[test]
    fn verifier_is_deterministic() {
        let a = pairing_verifier("Abc123Def456Ghi7").unwrap();
        let b = pairing_verifier("Abc123Def456Ghi7").unwrap();
        assert_eq!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn distinct_passwords_give_distinct_verifiers() {
        let mut verifiers = HashSet::new();
        for _ in 0..200 {
            let secret = generate_pairing_secret().unwrap();
            assert!(verifiers.insert(secret.verifier));
        }
        assert_ne!(
            pairing_verifier("password-one").unwrap(),
            pairing_verifier("password-two").unwrap()
        );
    }

    #[test]
    fn blank_password_rejected() {
        assert!(pairing_verifier("").is_err());
        assert!(pairing_verifier("   ").is_err());
    }

    #[test]
    fn verifier_matching() {
        let secret = generate_pairing_secret().unwrap();
        assert!(verifier_matches(&secret.password, &secret.verifier).unwrap());
        assert!(!verifier_matches("Wrong0Password00", &secret.verifier).unwrap());
        assert!(!verifier_matches(&secret.password, "not base64 !").unwrap());
        assert!(!verifier_matches(&secret.password, "").unwrap());
        assert!(verifier_matches("  ", &secret.verifier).is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let secret = generate_pairing_secret().unwrap();
        assert!(!format!("{:?}", secret).contains(&secret.password));
    }
}
