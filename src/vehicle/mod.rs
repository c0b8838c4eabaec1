pub mod model;
pub mod obu;

pub use model::{AccountStatus, OwnerAccount, SubscriptionTier, Vehicle, VehicleStatus};
pub use obu::{OnBoardUnit, ReceivedCommand};
