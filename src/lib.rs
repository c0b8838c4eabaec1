//! Vehicle digital keys: device pairing, key lifecycle and owner-to-friend
//! sharing, backed by P-256 certificates and ECIES.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod pairing;
pub mod pki;
pub mod sharing;
pub mod store;
pub mod system;
pub mod validation;
pub mod vehicle;

pub use config::ServiceConfig;
pub use error::{CryptoError, Error, ErrorKind, Result, SecurityViolation};
pub use keys::{DigitalKey, KeyAction, KeyLifecycleManager, KeyStatus, KeyType, TrackKeyRequest};
pub use pairing::{CompletePairingRequest, PairingSessionManager, PairingStatus};
pub use sharing::{KeySharingManager, ShareKeyRequest};
pub use system::{DigitalKeyPlatform, SimulatedBackends};
