pub mod lifecycle;
pub mod model;

pub use lifecycle::KeyLifecycleManager;
pub use model::{
    DigitalKey, KeyAction, KeyRestrictions, KeyStatus, KeyType, KeyUsageType, KeyValidation,
    PermissionLevel, Revocation, TrackKeyRequest,
};
