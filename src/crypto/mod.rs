pub mod ecies;
pub mod keys;
pub mod pairing;
pub mod vault;

pub use keys::{KeyMaterial, sign, verify};
pub use pairing::{PairingSecret, generate_pairing_secret, pairing_verifier, verifier_matches};
pub use vault::KeyVault;
