#![allow(dead_code)]

use std::sync::Arc;

use lattice_server::cluster::RecordingCluster;
use lattice_server::config::Config;
use lattice_server::model::Session;
use lattice_server::store::memory::MemoryStore;
use lattice_server::store::Stores;
use lattice_server::PlatformService;

/// Platform wired to in-memory stores and a recording cluster transport.
pub fn test_platform() -> (Arc<PlatformService>, Arc<RecordingCluster>, Arc<MemoryStore>) {
    test_platform_with(Config::default())
}

/// Platform with the presence engine disabled. Used by tests that assert
/// on exact send-queue contents, which the connect-time status broadcast
/// would otherwise race with.
pub fn test_platform_quiet() -> (Arc<PlatformService>, Arc<RecordingCluster>, Arc<MemoryStore>) {
    test_platform_with(Config {
        enable_user_statuses: false,
        ..Config::default()
    })
}

pub fn test_platform_with(
    config: Config,
) -> (Arc<PlatformService>, Arc<RecordingCluster>, Arc<MemoryStore>) {
    let mem = Arc::new(MemoryStore::default());
    let stores = Stores {
        status: mem.clone(),
        session: mem.clone(),
        user: mem.clone(),
        channel: mem.clone(),
    };
    let cluster = Arc::new(RecordingCluster::default());
    let platform = PlatformService::new(config, stores, Some(cluster.clone()));
    (platform, cluster, mem)
}

/// Save a never-expiring session for `user_id` and return its snapshot.
pub async fn seed_session(platform: &PlatformService, user_id: &str) -> Arc<Session> {
    let session = Session {
        id: lattice_common::id::prefixed_ulid("ses"),
        token: format!("tok_{user_id}"),
        user_id: user_id.to_string(),
        created_at: lattice_common::millis(),
        last_activity_at: lattice_common::millis(),
        roles: "system_user".to_string(),
        ..Default::default()
    };
    platform
        .stores
        .session
        .save(&session)
        .await
        .expect("seed session");
    Arc::new(session)
}
