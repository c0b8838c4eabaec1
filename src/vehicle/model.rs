use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    Basic,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub fn max_keys(&self) -> u32 {
        match self {
            SubscriptionTier::Basic => 5,
            SubscriptionTier::Premium => 20,
            SubscriptionTier::Enterprise => 100,
        }
    }

    pub fn key_lifetime_days(&self) -> i64 {
        match self {
            SubscriptionTier::Basic => 30,
            SubscriptionTier::Premium => 90,
            SubscriptionTier::Enterprise => 365,
        }
    }

    pub fn key_lifetime(&self) -> Duration {
        Duration::days(self.key_lifetime_days())
    }

    pub fn friend_keys_allowed(&self) -> bool {
        !matches!(self, SubscriptionTier::Basic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    Active,
    Inactive,
    Suspended,
}

/// The vehicle record as the key core sees it: identity, subscription
/// facts maintained elsewhere, and the counters this crate updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub vin: String,
    pub owner_id: String,
    pub status: VehicleStatus,
    pub subscription_tier: SubscriptionTier,
    pub subscription_active: bool,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub max_keys_allowed: u32,
    pub current_key_count: u32,
    pub public_key_certificate: Option<String>,
    pub pairing_verifier: Option<String>,
    pub total_key_usage_count: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Vehicle {
    /// An active vehicle on an active subscription, with the tier's key cap.
    pub fn new(vin: &str, owner_id: &str, tier: SubscriptionTier) -> Self {
        Self {
            vin: vin.to_string(),
            owner_id: owner_id.to_string(),
            status: VehicleStatus::Active,
            subscription_tier: tier,
            subscription_active: true,
            subscription_expires_at: None,
            max_keys_allowed: tier.max_keys(),
            current_key_count: 0,
            public_key_certificate: None,
            pairing_verifier: None,
            total_key_usage_count: 0,
            last_activity_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == VehicleStatus::Active
    }

    pub fn is_subscription_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.subscription_active && self.subscription_expires_at.is_none_or(|at| at > now)
    }

    pub fn can_add_more_keys(&self) -> bool {
        self.current_key_count < self.max_keys_allowed
    }

    pub fn can_create_friend_keys_at(&self, now: DateTime<Utc>) -> bool {
        self.subscription_tier.friend_keys_allowed() && self.is_subscription_valid_at(now)
    }

    pub fn increment_key_count(&mut self) {
        self.current_key_count += 1;
    }

    pub fn decrement_key_count(&mut self) {
        self.current_key_count = self.current_key_count.saturating_sub(1);
    }

    pub fn record_key_usage(&mut self, at: DateTime<Utc>) {
        self.total_key_usage_count += 1;
        self.last_activity_at = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Suspended,
    Locked,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerAccount {
    pub account_id: String,
    pub email: String,
    pub status: AccountStatus,
    pub email_verified: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OwnerAccount {
    pub fn new(account_id: &str, email: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            email: email.to_string(),
            status: AccountStatus::Active,
            email_verified: true,
            locked_until: None,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AccountStatus::Active && !self.is_locked_at(now)
    }

    /// Why this account may not hold keys right now, if anything.
    pub fn ineligibility_at(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.is_active_at(now) {
            Some("owner account is not active")
        } else if !self.email_verified {
            Some("owner email must be verified")
        } else {
            None
        }
    }
}
