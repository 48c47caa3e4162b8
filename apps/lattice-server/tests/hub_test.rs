mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use lattice_server::hub::conn::WebConn;
use lattice_server::model::event::{event_type, Broadcast};
use lattice_server::model::{Session, WebSocketEvent};
use lattice_server::PlatformService;

/// Register a live connection for the session's user and wait for the hub
/// to pick it up.
async fn register_conn(platform: &PlatformService, session: &Arc<Session>) -> Arc<WebConn> {
    let conn = WebConn::new(
        &session.user_id,
        Some(session.clone()),
        lattice_common::id::prefixed_ulid("conn"),
        0,
    );
    let hub = platform.hub_pool().pick_hub(&session.user_id);
    hub.register(conn.clone()).await;
    assert!(hub.is_registered(&session.user_id, &session.token).await);
    conn
}

async fn recv_event(
    rx: &mut tokio::sync::mpsc::Receiver<Arc<WebSocketEvent>>,
) -> Arc<WebSocketEvent> {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("send queue closed")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn broadcast_reaches_registered_connection() {
    let (platform, _, _) = common::test_platform_quiet();
    let session = common::seed_session(&platform, "u1").await;
    let conn = register_conn(&platform, &session).await;
    let mut rx = conn.take_receiver().unwrap();

    assert_eq!(recv_event(&mut rx).await.event_type(), event_type::HELLO);

    let ev = WebSocketEvent::new(
        event_type::POSTED,
        Broadcast {
            user_id: "u1".to_string(),
            ..Default::default()
        },
    )
    .with("message", "hi");
    platform.publish(ev).await;

    let got = recv_event(&mut rx).await;
    assert_eq!(got.event_type(), event_type::POSTED);
    assert_eq!(got.data()["message"], "hi");
}

#[tokio::test]
async fn channel_scoped_events_respect_membership() {
    let (platform, _, mem) = common::test_platform_quiet();
    let s1 = common::seed_session(&platform, "u1").await;
    let s2 = common::seed_session(&platform, "u2").await;
    mem.put_channel_member("u1", "ch1", "channel_user");

    let c1 = register_conn(&platform, &s1).await;
    let c2 = register_conn(&platform, &s2).await;
    let mut rx1 = c1.take_receiver().unwrap();
    let mut rx2 = c2.take_receiver().unwrap();
    assert_eq!(recv_event(&mut rx1).await.event_type(), event_type::HELLO);
    assert_eq!(recv_event(&mut rx2).await.event_type(), event_type::HELLO);

    platform
        .publish(WebSocketEvent::new(
            event_type::POSTED,
            Broadcast {
                channel_id: "ch1".to_string(),
                ..Default::default()
            },
        ))
        .await;
    // A marker event to u2 that must arrive after the channel fan-out.
    platform
        .publish(WebSocketEvent::new(
            event_type::USER_UPDATED,
            Broadcast {
                user_id: "u2".to_string(),
                ..Default::default()
            },
        ))
        .await;

    assert_eq!(recv_event(&mut rx1).await.event_type(), event_type::POSTED);
    // u2 never saw the channel event; the marker is next in its queue.
    assert_eq!(
        recv_event(&mut rx2).await.event_type(),
        event_type::USER_UPDATED
    );
}

#[tokio::test]
async fn registered_check_requires_matching_session_token() {
    let (platform, _, _) = common::test_platform_quiet();
    let session = common::seed_session(&platform, "u1").await;
    register_conn(&platform, &session).await;

    let pool = platform.hub_pool();
    assert!(pool.is_registered("u1", &session.token).await);
    assert!(!pool.is_registered("u1", "tok_other").await);
    assert!(!pool.is_registered("u2", &session.token).await);
}

#[tokio::test]
async fn full_send_queue_evicts_connection() {
    let (platform, _, _) = common::test_platform_quiet();
    let session = common::seed_session(&platform, "u1").await;
    let conn = register_conn(&platform, &session).await;

    // Nobody drains the queue; fill it to the brim.
    let filler = Arc::new(WebSocketEvent::new(
        event_type::POSTED,
        Broadcast::default(),
    ));
    while conn.try_enqueue(filler.clone()).is_ok() {}

    platform
        .publish(WebSocketEvent::new(
            event_type::POSTED,
            Broadcast {
                user_id: "u1".to_string(),
                ..Default::default()
            },
        ))
        .await;

    let metrics = platform.metrics.clone();
    wait_until(move || metrics.snapshot().conns_closed_full == 1).await;
    assert!(conn.closed().is_cancelled());
    assert!(!conn.is_active());
    assert!(!platform.hub_pool().is_registered("u1", &session.token).await);
}

#[tokio::test]
async fn closing_an_idle_tab_never_rewinds_fresher_activity() {
    let (platform, _, _) = common::test_platform();
    let session = common::seed_session(&platform, "u1").await;
    let idle = register_conn(&platform, &session).await;
    let fresh = register_conn(&platform, &session).await;

    // Let the connect-time presence write land first.
    wait_until(|| platform.get_status_from_cache("u1").is_some()).await;
    let before = platform.get_status_from_cache("u1").unwrap().last_activity_at;

    idle.set_last_user_activity_at(lattice_common::millis() - 3_600_000);
    platform.hub_pool().pick_hub("u1").deactivate(idle).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The remaining socket is fresh, so nothing is written back.
    assert!(platform.get_status_from_cache("u1").unwrap().last_activity_at >= before);

    // Once the remaining socket itself has idled past the away threshold,
    // closing another one records that stale timestamp.
    let extra = register_conn(&platform, &session).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stale = lattice_common::millis() - 400_000;
    fresh.set_last_user_activity_at(stale);
    platform.hub_pool().pick_hub("u1").deactivate(extra).await;
    wait_until(|| {
        platform
            .get_status_from_cache("u1")
            .is_some_and(|s| s.last_activity_at == stale)
    })
    .await;
}

#[tokio::test]
async fn queue_diagnostics_cover_all_of_a_users_connections() {
    let (platform, _, _) = common::test_platform_quiet();
    let session = common::seed_session(&platform, "u1").await;
    let c1 = register_conn(&platform, &session).await;
    let c2 = register_conn(&platform, &session).await;

    assert_eq!(platform.hub_pool().total_connections(), 2);

    let queues = platform.get_ws_queues("u1").await;
    assert_eq!(queues.len(), 2);
    let ids: Vec<&str> = queues.iter().map(|q| q.connection_id.as_str()).collect();
    assert!(ids.contains(&c1.get_connection_id().as_str()));
    assert!(ids.contains(&c2.get_connection_id().as_str()));
    for q in &queues {
        assert!(q.active);
        // Only the hello frame is queued so far.
        assert_eq!(q.queue_depth, 1);
        assert_eq!(q.reuse_count, 0);
    }
}

#[tokio::test]
async fn invalidate_user_revalidates_or_closes_connections() {
    let (platform, _, _) = common::test_platform_quiet();
    let session = common::seed_session(&platform, "u1").await;
    let conn = register_conn(&platform, &session).await;

    // The session is still valid, so revalidation keeps the socket open.
    platform.hub_pool().invalidate_user("u1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!conn.closed().is_cancelled());
    assert!(conn.is_authenticated());

    // Revoke the session everywhere, then invalidate again.
    platform
        .stores
        .session
        .remove_all_for_user("u1")
        .await
        .unwrap();
    platform.clear_session_cache_for_user_skip_cluster("u1");
    platform.hub_pool().invalidate_user("u1").await;

    let closed = conn.closed().clone();
    wait_until(move || closed.is_cancelled()).await;
}
