use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// EC key pair on secp256r1. The secret half stays inside this type; callers
/// sign and decrypt through its methods.
#[derive(Clone)]
pub struct KeyMaterial {
    secret: SecretKey,
}

impl KeyMaterial {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// SubjectPublicKeyInfo DER encoding of the public key.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        encode_public_key(&self.public_key())
    }

    pub fn public_key_base64(&self) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(self.public_key_der()?))
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key())
    }

    /// DER-encoded ECDSA signature over SHA-256 of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() {
            return Err(CryptoError::InvalidInput(
                "data to sign cannot be empty".to_string(),
            ));
        }
        let signing_key = SigningKey::from_bytes(&self.secret.to_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature: Signature = signing_key
            .try_sign(data)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

/// Signs with an optional key so an absent key is reported the same way as
/// empty data rather than panicking at the call site.
pub fn sign(data: &[u8], key: Option<&KeyMaterial>) -> Result<Vec<u8>, CryptoError> {
    match key {
        Some(key) => key.sign(data),
        None => Err(CryptoError::InvalidInput(
            "private key cannot be absent".to_string(),
        )),
    }
}

/// Never fails: malformed signatures, keys or mismatched data all yield `false`.
pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(public_key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(signature) else {
        return false;
    };
    VerifyingKey::from(&public_key)
        .verify(data, &signature)
        .is_ok()
}

pub fn encode_public_key(public_key: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    public_key
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Accepts SPKI DER (the wire format) or a raw SEC1 point.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_public_key_der(bytes)
        .or_else(|_| PublicKey::from_sec1_bytes(bytes))
        .map_err(|_| CryptoError::InvalidKey("not a P-256 public key".to_string()))
}

pub fn decode_public_key_base64(encoded: &str) -> Result<PublicKey, CryptoError> {
    let bytes = STANDARD.decode(encoded.trim())?;
    decode_public_key(&bytes)
}

pub fn fingerprint(public_key: &PublicKey) -> String {
    let point = public_key.to_encoded_point(false);
    let digest = Sha256::digest(point.as_bytes());
    hex::encode(&digest[..8])
}
