pub mod manager;
pub mod session;

pub use manager::PairingSessionManager;
pub use session::{
    CompletePairingRequest, PairingInitiation, PairingResult, PairingSession, PairingStatus,
};
