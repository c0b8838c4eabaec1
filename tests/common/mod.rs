#![allow(dead_code)]

use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::sync::Arc;

use vehicle_dkey::config::RetryConfig;
use vehicle_dkey::crypto::KeyMaterial;
use vehicle_dkey::vehicle::{OnBoardUnit, OwnerAccount, SubscriptionTier, Vehicle};
use vehicle_dkey::{CompletePairingRequest, DigitalKeyPlatform, ServiceConfig, SimulatedBackends};

pub const VIN: &str = "1HGCM82633A004352";
pub const OWNER_ID: &str = "OWNER001";
pub const OWNER_EMAIL: &str = "owner@example.com";

pub struct TestPlatform {
    pub platform: DigitalKeyPlatform,
    pub backends: SimulatedBackends,
    pub unit: Arc<OnBoardUnit>,
}

pub async fn platform(tier: SubscriptionTier) -> TestPlatform {
    let config = ServiceConfig {
        registry: RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
        },
        ..ServiceConfig::default()
    };
    let (platform, backends) = DigitalKeyPlatform::simulated(config).unwrap();
    platform
        .register_owner(OwnerAccount::new(OWNER_ID, OWNER_EMAIL))
        .await
        .unwrap();
    platform
        .register_vehicle(Vehicle::new(VIN, OWNER_ID, tier))
        .await
        .unwrap();
    platform
        .pairing
        .provision_vehicle_certificate(VIN)
        .await
        .unwrap();
    let unit = backends.attach_unit(VIN).await;
    TestPlatform {
        platform,
        backends,
        unit,
    }
}

pub fn device_request(session_id: &str, password: &str, device_id: &str) -> CompletePairingRequest {
    CompletePairingRequest {
        session_id: session_id.to_string(),
        pairing_password: password.to_string(),
        device_id: device_id.to_string(),
        device_oem: "Apple".to_string(),
        device_public_key: KeyMaterial::generate().public_key_base64().unwrap(),
        device_certificate: Some(STANDARD.encode(format!("{} attestation", device_id))),
    }
}

pub async fn vehicle(platform: &DigitalKeyPlatform) -> Vehicle {
    platform.storage.vehicles.get(VIN).await.unwrap().unwrap()
}
