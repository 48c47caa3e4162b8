//! Realtime presence and event-broadcast fabric for a multi-tenant
//! collaboration server: sharded connection hubs, reliable websocket
//! delivery with resume, a presence engine, and a cluster event plane.

pub mod busy;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod presence;
pub mod store;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use busy::{BusyState, ServerBusy};
use cache::StripedCache;
use cluster::Cluster;
use config::Config;
use error::AppError;
use hooks::{BroadcastHook, HookRunner};
use hub::conn::WebConn;
use hub::{HubPool, QueueInfo};
use metrics::{inc, WebSocketMetrics};
use model::event::{event_type, is_non_critical, requires_reliable_cluster_send, Broadcast};
use model::{ClusterEvent, ClusterMessage, ClusterSendType, Session, WebSocketEvent};
use presence::logs::StatusLogBuffer;
use presence::StatusUpdate;
use store::Stores;

type ConfigListener = Box<dyn Fn(&Config, &Config) + Send + Sync>;

/// Seam for a plugin environment. Websocket actions with the plugin
/// prefix and `plugin_event` cluster messages are handed here, unanswered.
pub trait PluginDispatcher: Send + Sync {
    fn on_websocket_action(&self, user_id: &str, req: &model::WebSocketRequest);
    fn on_cluster_event(&self, msg: &ClusterMessage);
}

/// Shared state of one server node. Everything the gateway, hubs, and
/// presence engine need hangs off an `Arc<PlatformService>`.
pub struct PlatformService {
    config: ArcSwap<Config>,
    config_listeners: Mutex<HashMap<String, ConfigListener>>,
    pub stores: Stores,
    /// token → session snapshot.
    session_cache: StripedCache<Arc<Session>>,
    /// user id → status.
    status_cache: StripedCache<model::Status>,
    hub_pool: HubPool,
    pub busy: ServerBusy,
    cluster: Option<Arc<dyn Cluster>>,
    pub metrics: Arc<WebSocketMetrics>,
    hooks: RwLock<HookRunner>,
    status_logs: StatusLogBuffer,
    plugin: RwLock<Option<Arc<dyn PluginDispatcher>>>,
    status_update_tx: mpsc::Sender<StatusUpdate>,
    status_update_rx: Mutex<Option<mpsc::Receiver<StatusUpdate>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl PlatformService {
    pub fn new(config: Config, stores: Stores, cluster: Option<Arc<dyn Cluster>>) -> Arc<Self> {
        let metrics = Arc::new(WebSocketMetrics::default());
        let (status_update_tx, status_update_rx) =
            mpsc::channel(presence::STATUS_UPDATE_BUFFER);
        let session_ttl = Duration::from_secs(config.session_cache_in_minutes as u64 * 60);
        let status_logs = StatusLogBuffer::new(
            config.max_status_logs,
            Duration::from_secs(config.status_log_retention_days as u64 * 24 * 60 * 60),
        );

        Arc::new_cyclic(|weak| {
            let hub_pool = HubPool::start(weak.clone(), stores.clone(), metrics.clone());
            PlatformService {
                config: ArcSwap::from_pointee(config),
                config_listeners: Mutex::new(HashMap::new()),
                stores,
                session_cache: StripedCache::new("sessions", Some(session_ttl)),
                status_cache: StripedCache::new("statuses", None),
                hub_pool,
                busy: ServerBusy::default(),
                cluster,
                metrics,
                hooks: RwLock::new(HookRunner::new()),
                status_logs,
                plugin: RwLock::new(None),
                status_update_tx,
                status_update_rx: Mutex::new(Some(status_update_rx)),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }
        })
    }

    /// Spawn the background workers. Call once, after construction.
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self.status_update_rx.lock().take() {
            let platform = self.clone();
            self.tracker.spawn(async move {
                platform.run_status_flusher(rx).await;
            });
        }
    }

    /// Stop the hubs and wait for background workers to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.hub_pool.stop_all().await;
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn hub_pool(&self) -> &HubPool {
        &self.hub_pool
    }

    pub fn status_logs(&self) -> &StatusLogBuffer {
        &self.status_logs
    }

    pub(crate) fn status_cache(&self) -> &StripedCache<model::Status> {
        &self.status_cache
    }

    pub(crate) fn status_update_tx(&self) -> &mpsc::Sender<StatusUpdate> {
        &self.status_update_tx
    }

    pub(crate) fn cluster_ref(&self) -> Option<&Arc<dyn Cluster>> {
        self.cluster.as_ref()
    }

    pub(crate) fn cache_session(&self, token: &str, session: Arc<Session>) {
        self.session_cache.set(token, session);
    }

    // --- config ---

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn add_config_listener(
        &self,
        listener: impl Fn(&Config, &Config) + Send + Sync + 'static,
    ) -> String {
        let id = lattice_common::id::prefixed_ulid("cfglis");
        self.config_listeners
            .lock()
            .insert(id.clone(), Box::new(listener));
        id
    }

    pub fn remove_config_listener(&self, id: &str) {
        self.config_listeners.lock().remove(id);
    }

    /// Swap in a new configuration, notify listeners, and tell clients the
    /// derived hash changed.
    pub async fn update_config(&self, new: Config) {
        let hash = new.client_config_hash();
        let old = self.config.swap(Arc::new(new.clone()));
        {
            let listeners = self.config_listeners.lock();
            for listener in listeners.values() {
                listener(&old, &new);
            }
        }
        let ev = WebSocketEvent::new(event_type::CONFIG_CHANGED, Broadcast::default())
            .with("config_hash", hash);
        self.publish(ev).await;
    }

    // --- publish ---

    /// Broadcast an event to local connections and, when a cluster is
    /// attached, to every peer node.
    pub async fn publish(&self, ev: WebSocketEvent) {
        self.publish_event(ev, true).await;
    }

    /// Local-only broadcast; used when handling an event that already
    /// traveled the cluster plane.
    pub async fn publish_skip_cluster_send(&self, ev: WebSocketEvent) {
        self.publish_event(ev, false).await;
    }

    async fn publish_event(&self, mut ev: WebSocketEvent, to_cluster: bool) {
        inc(&self.metrics.broadcasts);
        if self.busy.is_busy() && is_non_critical(ev.event_type()) {
            return;
        }
        ev.precompute();

        if to_cluster {
            if let Some(cluster) = &self.cluster {
                let send_type = if ev.broadcast().reliable_cluster_send
                    || requires_reliable_cluster_send(ev.event_type())
                {
                    ClusterSendType::Reliable
                } else {
                    ClusterSendType::BestEffort
                };
                match ev.to_cluster_json() {
                    Ok(data) => {
                        let msg = ClusterMessage::new(ClusterEvent::Publish, send_type, data);
                        if let Err(err) = cluster.send_cluster_message(msg).await {
                            tracing::warn!(error = %err, event = ev.event_type(),
                                "failed to forward broadcast to cluster");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, event = ev.event_type(),
                            "failed to encode broadcast for cluster");
                    }
                }
            }
        }

        self.hub_pool.broadcast(Arc::new(ev)).await;
    }

    // --- hooks ---

    pub fn register_broadcast_hook(&self, hook_id: &str, hook: Arc<dyn BroadcastHook>) {
        self.hooks.write().register(hook_id, hook);
    }

    pub fn apply_broadcast_hooks<'a>(
        &self,
        conn: &WebConn,
        ev: &'a WebSocketEvent,
    ) -> Cow<'a, WebSocketEvent> {
        self.hooks.read().apply(conn, ev)
    }

    // --- plugins ---

    pub fn set_plugin_dispatcher(&self, plugin: Arc<dyn PluginDispatcher>) {
        *self.plugin.write() = Some(plugin);
    }

    pub(crate) fn dispatch_plugin_event(&self, msg: &ClusterMessage) {
        if let Some(plugin) = self.plugin.read().as_ref() {
            plugin.on_cluster_event(msg);
        }
    }

    pub(crate) fn dispatch_plugin_action(&self, user_id: &str, req: &model::WebSocketRequest) {
        if let Some(plugin) = self.plugin.read().as_ref() {
            plugin.on_websocket_action(user_id, req);
        }
    }

    // --- sessions ---

    pub async fn get_session(&self, token: &str) -> Result<Arc<Session>, AppError> {
        if let Some(session) = self.session_cache.get(token) {
            return Ok(session);
        }
        let session = Arc::new(self.stores.session.get(token).await?);
        self.session_cache.set(token, session.clone());
        Ok(session)
    }

    /// Re-fetch a connection's session after its cache entry was dropped.
    /// The connection closes if the session is gone or expired.
    pub async fn revalidate_conn(&self, conn: Arc<WebConn>, token: String) {
        match self.get_session(&token).await {
            Ok(session) if !session.is_expired(lattice_common::millis()) => {
                conn.set_session(Some(session));
            }
            _ => conn.close(),
        }
    }

    // --- cache invalidation ---

    pub fn clear_session_cache_for_user_skip_cluster(&self, user_id: &str) {
        let mut tokens = Vec::new();
        self.session_cache.scan(|token, session| {
            if session.user_id == user_id {
                tokens.push(token.to_string());
            }
        });
        for token in tokens {
            self.session_cache.remove(&token);
        }
        self.status_cache.remove(user_id);
    }

    pub async fn clear_session_cache_for_user(&self, user_id: &str) {
        self.clear_session_cache_for_user_skip_cluster(user_id);
        self.notify_cluster(
            ClusterEvent::ClearSessionCacheForUser,
            user_id.as_bytes().to_vec(),
        )
        .await;
    }

    pub fn clear_session_cache_for_all_users_skip_cluster(&self) {
        self.session_cache.clear();
    }

    pub async fn clear_session_cache_for_all_users(&self) {
        self.clear_session_cache_for_all_users_skip_cluster();
        self.notify_cluster(ClusterEvent::ClearSessionCacheForAllUsers, Vec::new())
            .await;
    }

    /// Drop the session and membership snapshots on every live connection
    /// of a user, here and on peers.
    pub async fn invalidate_cache_for_webconn(&self, user_id: &str) {
        self.hub_pool.invalidate_user(user_id).await;
        self.notify_cluster(
            ClusterEvent::InvalidateWebconnCacheForUser,
            user_id.as_bytes().to_vec(),
        )
        .await;
    }

    pub fn invalidate_all_caches_skip_cluster(&self) {
        self.session_cache.clear();
        self.status_cache.clear();
    }

    pub async fn invalidate_all_caches(&self) {
        self.invalidate_all_caches_skip_cluster();
        self.notify_cluster(ClusterEvent::InvalidateAllCaches, Vec::new())
            .await;
    }

    async fn notify_cluster(&self, event: ClusterEvent, data: Vec<u8>) {
        let Some(cluster) = &self.cluster else { return };
        let msg = ClusterMessage::new(event, ClusterSendType::Reliable, data);
        if let Err(err) = cluster.send_cluster_message(msg).await {
            tracing::warn!(error = %err, ?event, "failed to send cluster message");
        }
    }

    // --- server busy ---

    pub async fn set_server_busy(&self, dur: Duration) {
        self.busy.set(dur);
        self.broadcast_busy_state().await;
    }

    pub async fn clear_server_busy(&self) {
        self.busy.clear();
        self.broadcast_busy_state().await;
    }

    async fn broadcast_busy_state(&self) {
        let state = self.busy.state();
        tracing::info!(busy = state.busy, expires_at = state.expires_at, "server busy state");
        match serde_json::to_vec(&state) {
            Ok(data) => self.notify_cluster(ClusterEvent::BusyStateChanged, data).await,
            Err(err) => tracing::warn!(error = %err, "failed to encode busy state"),
        }
    }

    pub fn apply_busy_state(&self, state: BusyState) {
        self.busy.apply(state);
    }

    // --- connection lifecycle (called by the hubs) ---

    /// First server frame on a fresh registration.
    pub fn hello_event(&self, conn: &WebConn) -> WebSocketEvent {
        let config = self.config.load();
        let connection_id = conn.get_connection_id();
        WebSocketEvent::new(
            event_type::HELLO,
            Broadcast {
                connection_id: connection_id.clone(),
                ..Default::default()
            },
        )
        .with("server_version", env!("CARGO_PKG_VERSION"))
        .with("config_hash", config.client_config_hash())
        .with("connection_id", connection_id)
        .with("enterprise_ready", false)
    }

    pub async fn on_connection_opened(self: &Arc<Self>, user_id: String) {
        if !self.config.load().enable_user_statuses {
            return;
        }
        self.set_status_online(&user_id, false).await;
    }

    /// `remaining_activity_at` is the freshest `last_user_activity_at`
    /// across the user's still-open connections; `None` means the closing
    /// connection was the last one.
    pub async fn on_connection_closed(
        self: &Arc<Self>,
        user_id: String,
        remaining_activity_at: Option<i64>,
    ) {
        if !self.config.load().enable_user_statuses {
            return;
        }
        match remaining_activity_at {
            None => self.queue_set_status_offline(&user_id, false).await,
            // Another socket is still open; record its activity only once
            // it is old enough to matter for the away check.
            Some(at) if self.is_user_away(at) => {
                self.set_status_last_activity_at(&user_id, at).await;
            }
            Some(_) => {}
        }
    }

    // --- diagnostics ---

    /// Queue snapshot for one user's connections on this node. Replay
    /// state is node-local, so this is meaningful on a single node only.
    pub async fn get_ws_queues(&self, user_id: &str) -> Vec<QueueInfo> {
        self.hub_pool.get_queues(user_id).await
    }
}
