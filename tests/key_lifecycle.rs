mod common;

use common::{VIN, platform, vehicle};
use vehicle_dkey::error::ErrorKind;
use vehicle_dkey::keys::{KeyUsageType, PermissionLevel};
use vehicle_dkey::vehicle::SubscriptionTier;
use vehicle_dkey::{KeyAction, KeyStatus, KeyType, TrackKeyRequest};

fn friend_request(key_id: &str, max_usage_count: Option<u64>) -> TrackKeyRequest {
    TrackKeyRequest {
        key_type: KeyType::Friend,
        friend_email: Some("friend@example.com".to_string()),
        permission_level: Some(PermissionLevel::DriveOnly),
        max_usage_count,
        ..TrackKeyRequest::owner(key_id, VIN, "galaxy-s24-friend", "Samsung")
    }
}

#[tokio::test]
async fn usage_exhaustion() {
    let t = platform(SubscriptionTier::Premium).await;
    let key = t
        .platform
        .keys
        .track(friend_request("FRIEND-KEY-000001", Some(3)))
        .await
        .unwrap();

    for expected in [KeyStatus::Active, KeyStatus::Active, KeyStatus::Expired] {
        let used = t
            .platform
            .keys
            .record_usage(&key.key_id, KeyUsageType::Unlock)
            .await
            .unwrap();
        assert_eq!(used.status, expected);
    }

    let fourth = t
        .platform
        .keys
        .record_usage(&key.key_id, KeyUsageType::Unlock)
        .await
        .unwrap_err();
    assert_eq!(fourth.kind(), ErrorKind::StateConflict);
    assert_eq!(vehicle(&t.platform).await.total_key_usage_count, 3);

    t.platform.effects.drain().await;
    let entry = t.backends.registry.entry(&key.key_id).await.unwrap();
    assert_eq!(entry.status, KeyStatus::Expired);
}

#[tokio::test]
async fn transition_guards() {
    let t = platform(SubscriptionTier::Premium).await;
    let keys = &t.platform.keys;
    let suspended = keys
        .track(TrackKeyRequest::owner("OWNER-KEY-000001", VIN, "iphone-15-pro", "Apple"))
        .await
        .unwrap();
    keys.manage(&suspended.key_id, KeyAction::Suspend, "Phone lost", "OWNER001")
        .await
        .unwrap();
    let twice = keys
        .manage(&suspended.key_id, KeyAction::Suspend, "Again", "OWNER001")
        .await
        .unwrap_err();
    assert_eq!(twice.kind(), ErrorKind::StateConflict);

    let expired = keys
        .track(TrackKeyRequest::owner("OWNER-KEY-000002", VIN, "pixel-8-pro", "Google"))
        .await
        .unwrap();
    keys.manage(&expired.key_id, KeyAction::Expire, "Lease ended", "SYSTEM")
        .await
        .unwrap();

    let terminated = keys
        .track(TrackKeyRequest::owner("OWNER-KEY-000003", VIN, "watch-ultra", "Apple"))
        .await
        .unwrap();
    keys.manage(&terminated.key_id, KeyAction::Terminate, "Sold", "OWNER001")
        .await
        .unwrap();

    for key_id in [&expired.key_id, &terminated.key_id] {
        let err = keys
            .manage(key_id, KeyAction::Resume, "Try again", "OWNER001")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }
    assert_eq!(vehicle(&t.platform).await.current_key_count, 2);

    t.platform.effects.drain().await;
    let commands = t.unit.received_commands().await;
    assert_eq!(commands.len(), 3);
}

#[tokio::test]
async fn registry_outage_does_not_roll_back() {
    let t = platform(SubscriptionTier::Premium).await;
    t.backends.registry.fail_next(2);

    let key = t
        .platform
        .keys
        .track(TrackKeyRequest::owner("OWNER-KEY-000009", VIN, "iphone-15-pro", "Apple"))
        .await
        .unwrap();
    assert_eq!(key.status, KeyStatus::Active);

    t.platform.effects.drain().await;
    assert!(t.backends.registry.entry(&key.key_id).await.is_some());
    assert_eq!(vehicle(&t.platform).await.current_key_count, 1);
}

#[tokio::test]
async fn basic_tier_limits() {
    let t = platform(SubscriptionTier::Basic).await;
    let friend = t
        .platform
        .keys
        .track(friend_request("FRIEND-KEY-000002", None))
        .await
        .unwrap_err();
    assert_eq!(friend.kind(), ErrorKind::Validation);

    for i in 0..5 {
        t.platform
            .keys
            .track(TrackKeyRequest::owner(
                &format!("OWNER-KEY-00010{}", i),
                VIN,
                "iphone-15-pro",
                "Apple",
            ))
            .await
            .unwrap();
    }
    let sixth = t
        .platform
        .keys
        .track(TrackKeyRequest::owner("OWNER-KEY-000199", VIN, "iphone-15-pro", "Apple"))
        .await
        .unwrap_err();
    assert_eq!(sixth.kind(), ErrorKind::Validation);
}
