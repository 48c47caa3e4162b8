mod common;

use std::time::Duration;

use lattice_server::config::Config;
use lattice_server::model::request::PresenceIndicator;
use lattice_server::model::status_log::{StatusLogReason, DEVICE_API};
use lattice_server::model::{ClusterEvent, Status, UserStatus, DND_EXPIRY_INTERVAL_SECS};

/// An Offline row carrying a pending DND restoration, as left behind by
/// the DND-inactivity demotion.
fn pending_dnd(user_id: &str, dnd_end_time: i64) -> Status {
    Status {
        user_id: user_id.to_string(),
        status: UserStatus::Offline,
        manual: false,
        last_activity_at: lattice_common::millis() - 3_600_000,
        active_channel: String::new(),
        prev_status: Some(UserStatus::Dnd),
        dnd_end_time,
    }
}

async fn wait_for_status(platform: &lattice_server::PlatformService, user_id: &str, wanted: UserStatus) {
    for _ in 0..200 {
        if platform
            .get_status_from_cache(user_id)
            .is_some_and(|s| s.status == wanted)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status never became {wanted}");
}

#[tokio::test]
async fn connect_restores_pending_dnd() {
    let (platform, _, _) = common::test_platform();
    let end = lattice_common::time::seconds() + 600;
    platform.add_status_cache_skip_cluster_send(pending_dnd("u1", end));

    platform.set_status_online("u1", false).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Dnd);
    assert!(status.manual);
    assert_eq!(status.dnd_end_time, end);
    assert!(status.prev_status.is_none());

    // The restored row is persisted, not just cached.
    let stored = platform.stores.status.get("u1").await.unwrap();
    assert_eq!(stored.status, UserStatus::Dnd);
}

#[tokio::test]
async fn explicit_online_still_restores_pending_dnd() {
    let (platform, _, _) = common::test_platform();
    let end = lattice_common::time::seconds() + 600;
    platform.add_status_cache_skip_cluster_send(pending_dnd("u1", end));

    // Picking Online by hand must not bypass the restoration.
    platform.set_status_online("u1", true).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Dnd);
    assert!(status.manual);
    assert_eq!(status.dnd_end_time, end);
}

#[tokio::test]
async fn away_never_overrides_pending_dnd() {
    let (platform, _, _) = common::test_platform();
    platform.add_status_cache_skip_cluster_send(pending_dnd("u1", 0));

    // Well past the away threshold, but the dormant DND must survive.
    platform.set_status_away_if_needed("u1", false).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Offline);
    assert_eq!(status.prev_status, Some(UserStatus::Dnd));
}

#[tokio::test]
async fn manual_statuses_resist_automatic_transitions() {
    let (platform, _, _) = common::test_platform();
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Away,
        manual: true,
        last_activity_at: lattice_common::millis() - 3_600_000,
        ..Default::default()
    });

    platform.set_status_online("u1", false).await;
    assert_eq!(
        platform.get_status_from_cache("u1").unwrap().status,
        UserStatus::Away
    );

    platform.set_status_offline("u1", false, false, DEVICE_API).await;
    assert_eq!(
        platform.get_status_from_cache("u1").unwrap().status,
        UserStatus::Away
    );

    // Force bypasses the protection.
    platform.set_status_offline("u1", false, true, DEVICE_API).await;
    assert_eq!(
        platform.get_status_from_cache("u1").unwrap().status,
        UserStatus::Offline
    );
}

#[tokio::test]
async fn timed_dnd_truncates_down_to_expiry_grid() {
    let (platform, _, _) = common::test_platform();
    // Deliberately off the grid.
    let wanted = lattice_common::time::seconds() + 150;
    platform.set_status_dnd_timed("u1", wanted).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Dnd);
    assert!(status.manual);
    assert_eq!(
        status.dnd_end_time,
        wanted - wanted.rem_euclid(DND_EXPIRY_INTERVAL_SECS)
    );
    assert!(status.dnd_end_time <= wanted);
}

#[tokio::test]
async fn timed_dnd_remembers_interrupted_status() {
    let (platform, _, _) = common::test_platform();
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Away,
        manual: false,
        last_activity_at: lattice_common::millis(),
        ..Default::default()
    });

    platform
        .set_status_dnd_timed("u1", lattice_common::time::seconds() + 600)
        .await;
    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Dnd);
    assert_eq!(status.prev_status, Some(UserStatus::Away));

    // An untimed DND has nothing to restore on expiry.
    platform.set_status_dnd("u2").await;
    assert!(platform
        .get_status_from_cache("u2")
        .unwrap()
        .prev_status
        .is_none());
}

#[tokio::test]
async fn expired_timed_dnd_restores_interrupted_status() {
    let (platform, _, _) = common::test_platform();
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Dnd,
        manual: true,
        last_activity_at: lattice_common::millis(),
        active_channel: String::new(),
        prev_status: Some(UserStatus::Away),
        dnd_end_time: lattice_common::time::seconds() - 60,
    });

    // The expiry sweep runs on the flusher task.
    platform.start();
    wait_for_status(&platform, "u1", UserStatus::Away).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert!(!status.manual);
    assert!(status.prev_status.is_none());
    assert_eq!(status.dnd_end_time, 0);
    platform.shutdown().await;
}

#[tokio::test]
async fn dnd_inactivity_demotion_clears_manual_flag() {
    let config = Config {
        accurate_statuses: true,
        dnd_inactivity_timeout_minutes: 1,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);
    let end = lattice_common::time::seconds() + 600;
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Dnd,
        manual: true,
        last_activity_at: lattice_common::millis() - 120_000,
        active_channel: String::new(),
        prev_status: None,
        dnd_end_time: end,
    });

    // No activity in the heartbeat; the DND inactivity timeout kicks in.
    platform
        .update_activity_from_heartbeat("u1", &PresenceIndicator::default())
        .await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Offline);
    assert!(!status.manual);
    assert_eq!(status.prev_status, Some(UserStatus::Dnd));
    // The timed end rides along for the restored DND.
    assert_eq!(status.dnd_end_time, end);
}

#[tokio::test]
async fn heartbeat_with_empty_cached_channel_refreshes_nothing() {
    let config = Config {
        accurate_statuses: true,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);
    let stale = lattice_common::millis() - 60_000;
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Online,
        last_activity_at: stale,
        ..Default::default()
    });

    let indicator = PresenceIndicator {
        channel_id: "ch1".to_string(),
        window_active: true,
        ..Default::default()
    };

    // First heartbeat after a page load: the cached channel is empty, so
    // nothing counts as activity, but the channel gets recorded.
    platform.update_activity_from_heartbeat("u1", &indicator).await;
    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.last_activity_at, stale);
    assert_eq!(status.active_channel, "ch1");

    // The same heartbeat with the channel known is activity.
    platform.update_activity_from_heartbeat("u1", &indicator).await;
    let status = platform.get_status_from_cache("u1").unwrap();
    assert!(status.last_activity_at > stale);
    assert_eq!(status.status, UserStatus::Online);
}

#[tokio::test]
async fn heartbeat_channel_switch_is_activity() {
    let config = Config {
        accurate_statuses: true,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Offline,
        manual: false,
        last_activity_at: lattice_common::millis() - 60_000,
        active_channel: "ch1".to_string(),
        ..Default::default()
    });

    // Background window, but the viewed channel changed.
    let indicator = PresenceIndicator {
        channel_id: "ch2".to_string(),
        window_active: false,
        ..Default::default()
    };
    platform.update_activity_from_heartbeat("u1", &indicator).await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Online);
    assert!(!status.manual);
}

#[tokio::test]
async fn no_offline_coerces_activity_back_online() {
    let config = Config {
        no_offline: true,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);

    // Even a manual Offline is coerced; that is the flag's one exception
    // to manual protection.
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Offline,
        manual: true,
        last_activity_at: lattice_common::millis() - 60_000,
        ..Default::default()
    });
    platform.set_online_if_no_offline("u1").await;
    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Online);
    assert!(!status.manual);

    // A manual Away stays put.
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u2".to_string(),
        status: UserStatus::Away,
        manual: true,
        last_activity_at: lattice_common::millis(),
        ..Default::default()
    });
    platform.set_online_if_no_offline("u2").await;
    assert_eq!(
        platform.get_status_from_cache("u2").unwrap().status,
        UserStatus::Away
    );

    // DND and out-of-office are never touched.
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u3".to_string(),
        status: UserStatus::Dnd,
        manual: true,
        last_activity_at: lattice_common::millis(),
        ..Default::default()
    });
    platform.set_online_if_no_offline("u3").await;
    assert_eq!(
        platform.get_status_from_cache("u3").unwrap().status,
        UserStatus::Dnd
    );
}

#[tokio::test]
async fn no_offline_defers_to_dnd_restoration() {
    let config = Config {
        no_offline: true,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);
    platform.add_status_cache_skip_cluster_send(pending_dnd("u1", 0));

    platform.set_online_if_no_offline("u1").await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Dnd);
    assert!(status.manual);
}

#[tokio::test]
async fn manual_action_promotes_auto_away_user() {
    let config = Config {
        accurate_statuses: true,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u1".to_string(),
        status: UserStatus::Away,
        manual: false,
        last_activity_at: lattice_common::millis() - 60_000,
        ..Default::default()
    });

    platform
        .update_activity_from_manual_action("u1", "ch1", DEVICE_API, StatusLogReason::Websocket)
        .await;

    let status = platform.get_status_from_cache("u1").unwrap();
    assert_eq!(status.status, UserStatus::Online);
    assert_eq!(status.active_channel, "ch1");
}

#[tokio::test]
async fn queued_offline_updates_flush_in_one_batch() {
    let (platform, _, _) = common::test_platform();
    platform.start();

    let now = lattice_common::millis();
    platform.add_status_cache_skip_cluster_send(Status::new_online("u1", now));
    platform.add_status_cache_skip_cluster_send(Status::new_online("u2", now));
    platform.add_status_cache_skip_cluster_send(Status {
        user_id: "u3".to_string(),
        status: UserStatus::Away,
        manual: true,
        last_activity_at: now,
        ..Default::default()
    });

    // Duplicate queue entries for u1 collapse into one write.
    platform.queue_set_status_offline("u1", false).await;
    platform.queue_set_status_offline("u1", false).await;
    platform.queue_set_status_offline("u2", false).await;
    platform.queue_set_status_offline("u3", false).await;

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(
        platform.stores.status.get("u1").await.unwrap().status,
        UserStatus::Offline
    );
    assert_eq!(
        platform.stores.status.get("u2").await.unwrap().status,
        UserStatus::Offline
    );
    // Manual status is protected from the queued non-manual offline.
    assert!(platform.stores.status.get("u3").await.is_err());
    assert_eq!(
        platform.get_status_from_cache("u3").unwrap().status,
        UserStatus::Away
    );

    platform.shutdown().await;
}

#[tokio::test]
async fn busy_server_sheds_status_broadcasts() {
    let (platform, cluster, _) = common::test_platform();
    platform.busy.set(Duration::from_secs(60));

    platform.set_status_online("u1", false).await;

    // The status itself still lands in the store and on the cluster.
    assert_eq!(
        platform.stores.status.get("u1").await.unwrap().status,
        UserStatus::Online
    );
    let msgs = cluster.take_messages();
    assert!(msgs.iter().any(|m| m.event == ClusterEvent::UpdateStatus));
    // But no status_change broadcast goes out while busy.
    assert!(!msgs.iter().any(|m| m.event == ClusterEvent::Publish));
}

#[tokio::test]
async fn disabled_statuses_ignore_transitions() {
    let config = Config {
        enable_user_statuses: false,
        ..Config::default()
    };
    let (platform, _, _) = common::test_platform_with(config);

    platform.set_status_online("u1", false).await;
    platform.set_status_dnd("u1").await;
    platform.set_status_away_if_needed("u1", true).await;

    assert!(platform.get_status_from_cache("u1").is_none());
    assert!(platform.stores.status.get("u1").await.is_err());
}
