//! Sharded connection hubs.
//!
//! Every hub is a single task that owns its slice of the connection index
//! outright, so fan-out never takes a lock. Connections are sharded by
//! hash(user id), which keeps all of one user's connections on the same
//! hub and makes "is this the user's last connection" a hub-local
//! question.

pub mod conn;
pub mod dead_queue;

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::metrics::{inc, WebSocketMetrics};
use crate::model::WebSocketEvent;
use crate::store::Stores;
use crate::PlatformService;

use conn::{ResumeState, WebConn};

/// Hub mailbox depth. Registration and broadcasts share it.
const HUB_QUEUE_SIZE: usize = 1024;

/// Detached connections older than this are reaped instead of resumed.
const INACTIVE_CONN_REAP_MS: i64 = 5 * 60 * 1000;

/// Reaper cadence.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of one connection's queues, for the diagnostics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueInfo {
    pub connection_id: String,
    pub active: bool,
    pub queue_depth: usize,
    pub dead_queue_seqs: Vec<i64>,
    pub reuse_count: i32,
}

enum HubMessage {
    Register(Arc<WebConn>),
    /// Socket closed; keep the connection dormant for resume and run the
    /// presence bookkeeping.
    Deactivate(Arc<WebConn>),
    /// Remove outright, without presence bookkeeping.
    Unregister(Arc<WebConn>),
    Broadcast(Arc<WebSocketEvent>),
    InvalidateUser(String),
    CheckConn {
        user_id: String,
        connection_id: String,
        reply: oneshot::Sender<Option<ResumeState>>,
    },
    IsRegistered {
        user_id: String,
        token: String,
        reply: oneshot::Sender<bool>,
    },
    GetQueues {
        user_id: String,
        reply: oneshot::Sender<Vec<QueueInfo>>,
    },
    Stop,
}

/// Cheap handle to one hub task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubMessage>,
    connection_count: Arc<AtomicI64>,
}

impl Hub {
    fn start(
        platform: Weak<PlatformService>,
        stores: Stores,
        metrics: Arc<WebSocketMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(HUB_QUEUE_SIZE);
        let connection_count = Arc::new(AtomicI64::new(0));
        let state = HubState {
            index: HashMap::new(),
            by_id: HashMap::new(),
            connection_count: connection_count.clone(),
            platform,
            stores,
            metrics,
        };
        tokio::spawn(state.run(rx));
        Hub {
            tx,
            connection_count,
        }
    }

    pub fn connection_count(&self) -> i64 {
        self.connection_count.load(Ordering::Acquire)
    }

    pub async fn register(&self, conn: Arc<WebConn>) {
        let _ = self.tx.send(HubMessage::Register(conn)).await;
    }

    pub async fn deactivate(&self, conn: Arc<WebConn>) {
        let _ = self.tx.send(HubMessage::Deactivate(conn)).await;
    }

    pub async fn unregister(&self, conn: Arc<WebConn>) {
        let _ = self.tx.send(HubMessage::Unregister(conn)).await;
    }

    pub async fn broadcast(&self, ev: Arc<WebSocketEvent>) {
        let _ = self.tx.send(HubMessage::Broadcast(ev)).await;
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        let _ = self
            .tx
            .send(HubMessage::InvalidateUser(user_id.to_string()))
            .await;
    }

    /// Look for a dormant connection to resume. On a hit the connection is
    /// removed from the hub and its queues are handed to the caller.
    pub async fn check_conn(&self, user_id: &str, connection_id: &str) -> Option<ResumeState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMessage::CheckConn {
                user_id: user_id.to_string(),
                connection_id: connection_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// True when the user has an active connection carrying this session
    /// token.
    pub async fn is_registered(&self, user_id: &str, token: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(HubMessage::IsRegistered {
                user_id: user_id.to_string(),
                token: token.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn get_queues(&self, user_id: &str) -> Vec<QueueInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(HubMessage::GetQueues {
                user_id: user_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(HubMessage::Stop).await;
    }
}

struct HubState {
    /// user id → that user's connections, in registration order.
    index: HashMap<String, Vec<Arc<WebConn>>>,
    /// connection id → connection, for connection-targeted events.
    by_id: HashMap<String, Arc<WebConn>>,
    connection_count: Arc<AtomicI64>,
    platform: Weak<PlatformService>,
    stores: Stores,
    metrics: Arc<WebSocketMetrics>,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::Receiver<HubMessage>) {
        let mut reaper = tokio::time::interval(REAP_INTERVAL);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if matches!(msg, HubMessage::Stop) {
                        break;
                    }
                    // A panic in one broadcast must not take the shard down
                    // with every connection it owns.
                    let result = AssertUnwindSafe(self.handle(msg)).catch_unwind().await;
                    if result.is_err() {
                        tracing::error!("hub message handler panicked; shard continues");
                    }
                }
                _ = reaper.tick() => {
                    self.reap_stale();
                }
            }
        }
        for conn in self.by_id.values() {
            conn.close();
        }
    }

    async fn handle(&mut self, msg: HubMessage) {
        match msg {
            HubMessage::Register(conn) => self.register(conn).await,
            HubMessage::Deactivate(conn) => self.deactivate(conn),
            HubMessage::Unregister(conn) => self.unregister(conn),
            HubMessage::Broadcast(ev) => self.broadcast(ev).await,
            HubMessage::InvalidateUser(user_id) => self.invalidate_user(&user_id),
            HubMessage::CheckConn {
                user_id,
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.check_conn(&user_id, &connection_id));
            }
            HubMessage::IsRegistered {
                user_id,
                token,
                reply,
            } => {
                let registered = self.index.get(&user_id).is_some_and(|conns| {
                    conns.iter().any(|c| {
                        c.is_active() && c.session().is_some_and(|s| s.token == token)
                    })
                });
                let _ = reply.send(registered);
            }
            HubMessage::GetQueues { user_id, reply } => {
                let infos = self
                    .index
                    .get(&user_id)
                    .map(|conns| {
                        conns
                            .iter()
                            .map(|c| QueueInfo {
                                connection_id: c.get_connection_id(),
                                active: c.is_active(),
                                queue_depth: c.queue_depth(),
                                dead_queue_seqs: c.dead_queue.lock().seqs(),
                                reuse_count: c.reuse_count(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(infos);
            }
            HubMessage::Stop => unreachable!("handled by the loop"),
        }
    }

    async fn register(&mut self, conn: Arc<WebConn>) {
        let user_id = conn.user_id();
        self.index
            .entry(user_id.clone())
            .or_default()
            .push(conn.clone());
        self.by_id
            .insert(conn.get_connection_id(), conn.clone());
        self.connection_count.fetch_add(1, Ordering::AcqRel);

        if conn.is_authenticated() && conn.reuse_count() == 0 {
            if let Some(platform) = self.platform.upgrade() {
                let hello = Arc::new(platform.hello_event(&conn));
                if conn.try_enqueue(hello).is_ok() {
                    inc(&self.metrics.events_sent);
                }
                tokio::spawn(async move {
                    platform.on_connection_opened(user_id).await;
                });
            }
        }
    }

    /// The socket is gone but the connection stays indexed, dormant, so a
    /// client reconnect can adopt its queues within the replay window.
    fn deactivate(&mut self, conn: Arc<WebConn>) {
        conn.mark_inactive();
        if !conn.is_authenticated() {
            self.unregister(conn);
            return;
        }
        let user_id = conn.user_id();
        // Freshest activity among the sockets still open; None means this
        // was the user's last one.
        let remaining_activity = self.index.get(&user_id).and_then(|conns| {
            conns
                .iter()
                .filter(|c| c.is_active())
                .map(|c| c.last_user_activity_at())
                .max()
        });
        if let Some(platform) = self.platform.upgrade() {
            tokio::spawn(async move {
                platform
                    .on_connection_closed(user_id, remaining_activity)
                    .await;
            });
        }
    }

    fn unregister(&mut self, conn: Arc<WebConn>) {
        if self.remove(&conn) {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Remove a connection from both maps. True if it was present.
    fn remove(&mut self, conn: &Arc<WebConn>) -> bool {
        let user_id = conn.user_id();
        let mut found = false;
        if let Some(conns) = self.index.get_mut(&user_id) {
            let before = conns.len();
            conns.retain(|c| !Arc::ptr_eq(c, conn));
            found = conns.len() != before;
            if conns.is_empty() {
                self.index.remove(&user_id);
            }
        }
        let id = conn.get_connection_id();
        if self
            .by_id
            .get(&id)
            .is_some_and(|c| Arc::ptr_eq(c, conn))
        {
            self.by_id.remove(&id);
        }
        found
    }

    async fn broadcast(&mut self, ev: Arc<WebSocketEvent>) {
        // Connection- and user-targeted events short-circuit the scan.
        if !ev.broadcast().connection_id.is_empty() {
            if let Some(conn) = self.by_id.get(&ev.broadcast().connection_id).cloned() {
                self.deliver(&conn, &ev).await;
            }
            return;
        }
        if !ev.broadcast().user_id.is_empty() {
            let conns = self
                .index
                .get(&ev.broadcast().user_id)
                .cloned()
                .unwrap_or_default();
            for conn in conns {
                self.deliver(&conn, &ev).await;
            }
            return;
        }

        let conns: Vec<Arc<WebConn>> = self.by_id.values().cloned().collect();
        for conn in conns {
            self.deliver(&conn, &ev).await;
        }
    }

    async fn deliver(&mut self, conn: &Arc<WebConn>, ev: &Arc<WebSocketEvent>) {
        if !conn
            .should_send_event(ev, &self.stores, &self.metrics)
            .await
        {
            return;
        }
        if conn.queue_depth() >= conn::SEND_FULL_WARN_THRESHOLD && conn.should_warn("full") {
            tracing::warn!(
                user_id = %conn.user_id(),
                connection_id = %conn.get_connection_id(),
                depth = conn.queue_depth(),
                "websocket send queue nearly full"
            );
        }
        match conn.try_enqueue(ev.clone()) {
            Ok(()) => inc(&self.metrics.events_sent),
            Err(()) => {
                // A full queue means the client stopped draining. Close the
                // socket and drop the connection from the index; the client
                // can resume through the dead queue.
                inc(&self.metrics.conns_closed_full);
                tracing::warn!(
                    user_id = %conn.user_id(),
                    connection_id = %conn.get_connection_id(),
                    "websocket send queue full; closing connection"
                );
                conn.close();
                conn.mark_inactive();
            }
        }
    }

    fn invalidate_user(&mut self, user_id: &str) {
        let Some(conns) = self.index.get(user_id) else {
            return;
        };
        for conn in conns.iter().cloned() {
            let token = conn.session().map(|s| s.token.clone());
            conn.invalidate_cache();
            match (token, self.platform.upgrade()) {
                (Some(token), Some(platform)) => {
                    tokio::spawn(async move {
                        platform.revalidate_conn(conn, token).await;
                    });
                }
                _ => conn.close(),
            }
        }
    }

    fn check_conn(&mut self, user_id: &str, connection_id: &str) -> Option<ResumeState> {
        let conn = self
            .index
            .get(user_id)?
            .iter()
            .find(|c| !c.is_active() && c.get_connection_id() == connection_id)
            .cloned()?;
        let state = conn.extract_resume_state();
        self.remove(&conn);
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
        state
    }

    fn reap_stale(&mut self) {
        let cutoff = lattice_common::millis() - INACTIVE_CONN_REAP_MS;
        let stale: Vec<Arc<WebConn>> = self
            .by_id
            .values()
            .filter(|c| {
                let since = c.inactive_since();
                !c.is_active() && since != 0 && since < cutoff
            })
            .cloned()
            .collect();
        for conn in stale {
            tracing::debug!(
                connection_id = %conn.get_connection_id(),
                "reaping stale detached connection"
            );
            if self.remove(&conn) {
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// The fixed set of hubs, sized at twice the CPU count.
pub struct HubPool {
    hubs: Vec<Hub>,
    /// Per-process random seed, so shard assignment differs across runs.
    hasher: RandomState,
}

impl HubPool {
    pub fn start(
        platform: Weak<PlatformService>,
        stores: Stores,
        metrics: Arc<WebSocketMetrics>,
    ) -> Self {
        let n = std::thread::available_parallelism()
            .map(|p| p.get() * 2)
            .unwrap_or(2);
        Self::start_with_size(n, platform, stores, metrics)
    }

    pub fn start_with_size(
        n: usize,
        platform: Weak<PlatformService>,
        stores: Stores,
        metrics: Arc<WebSocketMetrics>,
    ) -> Self {
        let hubs = (0..n.max(1))
            .map(|_| Hub::start(platform.clone(), stores.clone(), metrics.clone()))
            .collect();
        HubPool {
            hubs,
            hasher: RandomState::new(),
        }
    }

    /// All of a user's connections land on the same hub.
    pub fn pick_hub(&self, user_id: &str) -> &Hub {
        let idx = (self.hasher.hash_one(user_id) % self.hubs.len() as u64) as usize;
        &self.hubs[idx]
    }

    pub fn total_connections(&self) -> i64 {
        self.hubs.iter().map(Hub::connection_count).sum()
    }

    /// Route a broadcast: targeted events go to one shard, everything else
    /// fans out to all of them.
    pub async fn broadcast(&self, ev: Arc<WebSocketEvent>) {
        if !ev.broadcast().user_id.is_empty() {
            self.pick_hub(&ev.broadcast().user_id).broadcast(ev).await;
            return;
        }
        for hub in &self.hubs {
            hub.broadcast(ev.clone()).await;
        }
    }

    pub async fn invalidate_user(&self, user_id: &str) {
        self.pick_hub(user_id).invalidate_user(user_id).await;
    }

    pub async fn is_registered(&self, user_id: &str, token: &str) -> bool {
        self.pick_hub(user_id).is_registered(user_id, token).await
    }

    pub async fn get_queues(&self, user_id: &str) -> Vec<QueueInfo> {
        self.pick_hub(user_id).get_queues(user_id).await
    }

    pub async fn stop_all(&self) {
        for hub in &self.hubs {
            hub.stop().await;
        }
    }
}
