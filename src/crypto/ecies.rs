//! ECIES over P-256: ephemeral ECDH, KDF2/SHA-256, AES-128-CTR and
//! HMAC-SHA-256 (encrypt-then-MAC).
//!
//! Ciphertext layout: `ephemeral point (65 bytes, uncompressed) || body || tag (32 bytes)`.

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::keys::{KeyMaterial, decode_public_key};
use crate::error::CryptoError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const DERIVATION_VECTOR: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
const ENCODING_VECTOR: [u8; 8] = [8, 7, 6, 5, 4, 3, 2, 1];
const CIPHER_KEY_LEN: usize = 16;
const MAC_KEY_LEN: usize = 16;
const POINT_LEN: usize = 65;
const TAG_LEN: usize = 32;
const ZERO_IV: [u8; 16] = [0u8; 16];

const SELF_TEST_MESSAGE: &str = "ECIES_TEST_MESSAGE";

pub fn encrypt(plaintext: &[u8], recipient_public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient = decode_public_key(recipient_public_key)?;
    encrypt_to(plaintext, &recipient)
}

pub fn encrypt_to(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(recipient);

    let (cipher_key, mac_key) =
        derive_keys(ephemeral_point.as_bytes(), shared.raw_secret_bytes().as_slice());

    let mut body = plaintext.to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&cipher_key, &ZERO_IV)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher.apply_keystream(&mut body);

    let tag = compute_tag(&mac_key, &body)
        .map_err(CryptoError::Encryption)?
        .finalize()
        .into_bytes();

    let mut out = Vec::with_capacity(POINT_LEN + body.len() + TAG_LEN);
    out.extend_from_slice(ephemeral_point.as_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Fails closed: the tag is checked before any byte is decrypted, and every
/// failure maps to `CryptoError::Decryption`.
pub fn decrypt(ciphertext: &[u8], recipient: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < POINT_LEN + TAG_LEN {
        return Err(CryptoError::Decryption("ciphertext too short".to_string()));
    }
    let (point, rest) = ciphertext.split_at(POINT_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

    let ephemeral = PublicKey::from_sec1_bytes(point)
        .map_err(|_| CryptoError::Decryption("invalid ephemeral point".to_string()))?;
    let shared = p256::ecdh::diffie_hellman(
        recipient.secret().to_nonzero_scalar(),
        ephemeral.as_affine(),
    );

    let (cipher_key, mac_key) = derive_keys(point, shared.raw_secret_bytes().as_slice());

    compute_tag(&mac_key, body)
        .map_err(CryptoError::Decryption)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::Decryption("MAC check failed".to_string()))?;

    let mut plaintext = body.to_vec();
    let mut cipher = Aes128Ctr::new_from_slices(&cipher_key, &ZERO_IV)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

pub fn encrypt_string(plaintext: &str, recipient_public_key: &[u8]) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(encrypt(plaintext.as_bytes(), recipient_public_key)?))
}

pub fn decrypt_string(encoded: &str, recipient: &KeyMaterial) -> Result<String, CryptoError> {
    let ciphertext = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;
    let plaintext = decrypt(&ciphertext, recipient)?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".to_string()))
}

/// Round-trips a fixed message through the key pair; used before fresh key
/// material is persisted or handed out.
pub fn validate_key_pair(key: &KeyMaterial) -> bool {
    let Ok(public) = key.public_key_der() else {
        return false;
    };
    match encrypt_string(SELF_TEST_MESSAGE, &public).and_then(|c| decrypt_string(&c, key)) {
        Ok(decrypted) => decrypted == SELF_TEST_MESSAGE,
        Err(_) => false,
    }
}

fn derive_keys(ephemeral_point: &[u8], shared_x: &[u8]) -> ([u8; CIPHER_KEY_LEN], [u8; MAC_KEY_LEN]) {
    let mut z = Vec::with_capacity(ephemeral_point.len() + shared_x.len());
    z.extend_from_slice(ephemeral_point);
    z.extend_from_slice(shared_x);

    let okm = kdf2(&z, &DERIVATION_VECTOR, CIPHER_KEY_LEN + MAC_KEY_LEN);
    let mut cipher_key = [0u8; CIPHER_KEY_LEN];
    let mut mac_key = [0u8; MAC_KEY_LEN];
    cipher_key.copy_from_slice(&okm[..CIPHER_KEY_LEN]);
    mac_key.copy_from_slice(&okm[CIPHER_KEY_LEN..]);
    (cipher_key, mac_key)
}

/// KDF2 (ISO 18033-2): `Hash(Z || counter || OtherInfo)` with a 32-bit
/// big-endian counter starting at 1.
fn kdf2(z: &[u8], other_info: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(z);
        hasher.update(counter.to_be_bytes());
        hasher.update(other_info);
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn compute_tag(mac_key: &[u8], body: &[u8]) -> Result<HmacSha256, String> {
    let mut mac = HmacSha256::new_from_slice(mac_key).map_err(|e| e.to_string())?;
    mac.update(body);
    mac.update(&ENCODING_VECTOR);
    mac.update(&((ENCODING_VECTOR.len() as u64) * 8).to_be_bytes());
    Ok(mac)
}
