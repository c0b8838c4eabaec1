pub mod invitation;
pub mod manager;

pub use invitation::{InvitationStatus, KeySharingInvitation, ShareKeyRequest};
pub use manager::KeySharingManager;
