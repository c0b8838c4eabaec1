use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use log::warn;
use std::env;

use vehicle_dkey::crypto::{KeyMaterial, ecies};
use vehicle_dkey::keys::{KeyUsageType, PermissionLevel};
use vehicle_dkey::vehicle::{OwnerAccount, SubscriptionTier, Vehicle};
use vehicle_dkey::{
    CompletePairingRequest, DigitalKeyPlatform, ServiceConfig, ShareKeyRequest, TrackKeyRequest,
};

const DEMO_VIN: &str = "1HGCM82633A004352";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => ServiceConfig::load(&path)
            .await
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ServiceConfig::default(),
    };

    println!("\n");
    println!("╔═══════════════════════════════════════════════════════╗");
    println!("║                                                       ║");
    println!("║        Vehicle Digital Key Platform (P-256)           ║");
    println!("║              Pairing & Sharing Walkthrough            ║");
    println!("║                                                       ║");
    println!("╚═══════════════════════════════════════════════════════╝");
    println!("\n");

    let (platform, backends) = DigitalKeyPlatform::simulated(config)?;
    platform
        .register_owner(OwnerAccount::new("OWNER001", "owner@example.com"))
        .await?;
    platform
        .register_vehicle(Vehicle::new(DEMO_VIN, "OWNER001", SubscriptionTier::Premium))
        .await?;
    let unit = backends.attach_unit(DEMO_VIN).await;

    println!("[1/5] Provisioning vehicle certificate...");
    let certificate = platform.pairing.provision_vehicle_certificate(DEMO_VIN).await?;
    platform.ca.verify_vehicle_certificate(&certificate).await?;
    println!("      ✓ Certificate issued by {}\n", platform.ca.issuer);

    println!("[2/5] Pairing owner device...");
    let initiation = platform.pairing.initiate(DEMO_VIN, "OWNER001").await?;
    platform.effects.drain().await;
    println!(
        "      ✓ Session {} (OBU verifier stored: {})",
        initiation.session_id,
        unit.check_pairing_password(&initiation.session_id, &initiation.pairing_password)
            .await
    );

    let device = KeyMaterial::generate();
    let result = platform
        .pairing
        .complete(CompletePairingRequest {
            session_id: initiation.session_id.clone(),
            pairing_password: initiation.pairing_password.clone(),
            device_id: "iphone-15-pro-owner".to_string(),
            device_oem: "Apple".to_string(),
            device_public_key: device.public_key_base64()?,
            device_certificate: Some(STANDARD.encode(b"Apple device attestation")),
        })
        .await?;
    println!("      ✓ Pairing {:?}, cross-signed certificate issued", result.status);

    let sealed = ecies::encrypt(
        b"owner key mobilization data",
        &STANDARD.decode(&result.vehicle_public_key)?,
    )?;
    let opened = platform
        .pairing
        .open_sealed(&result.session_id, &STANDARD.encode(sealed))
        .await?;
    println!("      ✓ Sealed device message opened ({} bytes)\n", opened.len());

    println!("[3/5] Tracking owner key and recording usage...");
    let owner_key = platform
        .keys
        .track(TrackKeyRequest::owner(
            "OWNER-KEY-IPHONE-0001",
            DEMO_VIN,
            "iphone-15-pro-owner",
            "Apple",
        ))
        .await?;
    for usage in [KeyUsageType::Unlock, KeyUsageType::StartEngine, KeyUsageType::Lock] {
        platform.keys.record_usage(&owner_key.key_id, usage).await?;
    }
    let validation = platform.keys.validate(&owner_key.key_id).await?;
    println!(
        "      ✓ Key {} valid: {}, expires {:?}\n",
        owner_key.key_id, validation.valid, validation.expires_at
    );

    println!("[4/5] Sharing a friend key...");
    let mut share = ShareKeyRequest::new(
        DEMO_VIN,
        "friend@example.com",
        PermissionLevel::DriveOnly,
        "OWNER001",
    );
    share.max_usage_count = Some(10);
    let invitation = platform.sharing.share(share).await?;
    let friend_key = platform
        .sharing
        .accept(&invitation.invitation_code, "galaxy-s24-friend", "Samsung")
        .await?;
    println!(
        "      ✓ Invitation {} accepted as {} ({:?})",
        invitation.invitation_code, friend_key.key_id, friend_key.permission_level
    );
    platform
        .keys
        .record_usage(&friend_key.key_id, KeyUsageType::Unlock)
        .await?;
    platform
        .sharing
        .revoke(&friend_key.key_id, "OWNER001", "Car returned")
        .await?;
    println!("      ✓ Friend key revoked\n");

    println!("[5/5] Flushing side effects...");
    platform.shutdown().await;
    if platform.effects.pending() > 0 {
        warn!("{} side effects still pending", platform.effects.pending());
    }

    let vehicle = platform
        .storage
        .vehicles
        .get(DEMO_VIN)
        .await?
        .context("demo vehicle disappeared")?;

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              Walkthrough Complete!                    ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");
    println!("Summary:");
    println!(
        "  • Keys on vehicle: {}/{}",
        vehicle.current_key_count, vehicle.max_keys_allowed
    );
    println!("  • Total key uses: {}", vehicle.total_key_usage_count);
    println!("  • Certificates issued: {}", platform.ca.get_total_issued().await);
    println!("  • Vault operations: {}", platform.vault.get_operation_count().await);
    println!(
        "  • Telematics messages: {}",
        backends.telematics.get_message_count()
    );
    println!("  • Notifications sent: {}", backends.notifier.sent().await.len());
    println!("  • Audit entries: {}", platform.audit.entries().await.len());
    println!(
        "  • Security events: {}",
        platform.audit.security_events().await.len()
    );
    println!();

    Ok(())
}
