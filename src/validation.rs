//! Input checks shared by the managers. Each returns `Error::Validation`
//! with a message fit for the caller.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::vehicle::{OwnerAccount, Vehicle};

const MAX_EMAIL_LEN: usize = 100;

/// 17 characters from `[A-HJ-NPR-Z0-9]`; position 9 (the check digit) must
/// be a digit or `X`.
pub fn validate_vin(vin: &str) -> Result<()> {
    if vin.trim().is_empty() {
        return Err(invalid("VIN cannot be empty"));
    }
    if vin.len() != 17 {
        return Err(invalid("VIN must be exactly 17 characters"));
    }
    let allowed = |c: char| (c.is_ascii_uppercase() && !matches!(c, 'I' | 'O' | 'Q')) || c.is_ascii_digit();
    if !vin.chars().all(allowed) {
        return Err(invalid("VIN contains invalid characters. Cannot contain I, O, or Q"));
    }
    let check = vin.as_bytes()[8];
    if !(check.is_ascii_digit() || check == b'X') {
        return Err(invalid("Invalid VIN check digit"));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<()> {
    if email.trim().is_empty() {
        return Err(invalid("Email cannot be empty"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(invalid("Email cannot exceed 100 characters"));
    }
    if !is_well_formed_email(email) {
        return Err(invalid("Invalid email format"));
    }
    Ok(())
}

fn is_well_formed_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-'));
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    let tld_ok = tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic());
    local_ok && host_ok && tld_ok
}

pub fn validate_key_id(key_id: &str) -> Result<()> {
    if key_id.trim().is_empty() {
        return Err(invalid("Key ID is required"));
    }
    if !(10..=100).contains(&key_id.len()) {
        return Err(invalid("Key ID must be between 10 and 100 characters"));
    }
    if !key_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("Key ID may only contain letters, digits, '_' and '-'"));
    }
    Ok(())
}

pub fn validate_device(device_id: &str, device_oem: &str) -> Result<()> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(invalid("Device ID is required"));
    }
    if !(5..=100).contains(&device_id.len()) {
        return Err(invalid("Device ID must be between 5 and 100 characters"));
    }
    let device_oem = device_oem.trim();
    if !(2..=50).contains(&device_oem.len()) {
        return Err(invalid("Device OEM must be between 2 and 50 characters"));
    }
    Ok(())
}

/// Active vehicle on a valid subscription.
pub fn validate_subscription(vehicle: &Vehicle, now: DateTime<Utc>) -> Result<()> {
    if !vehicle.subscription_active {
        return Err(invalid("Vehicle subscription is not active"));
    }
    if !vehicle.is_subscription_valid_at(now) {
        return Err(invalid("Vehicle subscription has expired"));
    }
    if !vehicle.is_active() {
        return Err(Error::Validation(format!(
            "Vehicle is not in active status: {:?}",
            vehicle.status
        )));
    }
    Ok(())
}

pub fn validate_key_capacity(vehicle: &Vehicle) -> Result<()> {
    if !vehicle.can_add_more_keys() {
        return Err(Error::Validation(format!(
            "Maximum number of keys reached for this vehicle ({})",
            vehicle.max_keys_allowed
        )));
    }
    Ok(())
}

pub fn validate_owner(owner: &OwnerAccount, now: DateTime<Utc>) -> Result<()> {
    match owner.ineligibility_at(now) {
        Some(reason) => Err(invalid(reason)),
        None => Ok(()),
    }
}

/// A requested key expiry must be in the future and inside the tier's
/// maximum key lifetime.
pub fn validate_key_expiry(
    vehicle: &Vehicle,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    if expires_at <= now {
        return Err(invalid("Expiration date cannot be in the past"));
    }
    let tier = vehicle.subscription_tier;
    if expires_at > now + tier.key_lifetime() {
        return Err(Error::Validation(format!(
            "Expiration date exceeds subscription tier limit of {} days",
            tier.key_lifetime_days()
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> Error {
    Error::Validation(message.to_string())
}
