mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lattice_server::config::Config;
use lattice_server::model::ClusterEvent;

#[tokio::test]
async fn listeners_fire_once_per_update_and_removal_sticks() {
    let (platform, _, _) = common::test_platform_quiet();

    let calls = Arc::new(AtomicUsize::new(0));
    let c1 = calls.clone();
    let c2 = calls.clone();
    let id1 = platform.add_config_listener(move |_, _| {
        c1.fetch_add(1, Ordering::SeqCst);
    });
    let id2 = platform.add_config_listener(move |_, _| {
        c2.fetch_add(1, Ordering::SeqCst);
    });

    platform
        .update_config(Config {
            user_status_away_timeout: 123,
            ..Config::default()
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(platform.config().user_status_away_timeout, 123);

    platform.remove_config_listener(&id1);
    platform.remove_config_listener(&id2);
    // Removing an id twice is harmless.
    platform.remove_config_listener(&id1);

    platform.update_config(Config::default()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn config_update_announces_new_hash_to_peers() {
    let (platform, cluster, _) = common::test_platform_quiet();

    let new = Config {
        accurate_statuses: !Config::default().accurate_statuses,
        ..Config::default()
    };
    let expected_hash = new.client_config_hash();
    platform.update_config(new).await;

    let msgs = cluster.take_messages();
    let publish = msgs
        .iter()
        .find(|m| m.event == ClusterEvent::Publish)
        .expect("config change publishes to the cluster");
    let decoded: serde_json::Value = serde_json::from_slice(&publish.data).unwrap();
    assert_eq!(decoded["event"], "config_changed");
    assert_eq!(decoded["data"]["config_hash"], expected_hash);
}
