//! Server-side state for one live websocket connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics::{inc, WebSocketMetrics};
use crate::model::event::{event_type, is_non_critical};
use crate::model::{Session, WebSocketEvent};
use crate::store::Stores;

use super::dead_queue::DeadQueue;

/// Bounded send queue capacity per connection.
pub const SEND_QUEUE_SIZE: usize = 256;
/// Depth at which non-critical events are shed.
pub const SEND_SLOW_THRESHOLD: usize = SEND_QUEUE_SIZE / 2;
/// Depth at which a rate-limited "full" warning is emitted.
pub const SEND_FULL_WARN_THRESHOLD: usize = SEND_QUEUE_SIZE * 95 / 100;

/// TTL of the per-connection channel-membership cache.
const CHANNEL_MEMBERS_TTL: Duration = Duration::from_secs(30 * 60);
/// Per-connection, per-kind warning rate limit.
const WARN_INTERVAL: Duration = Duration::from_secs(60);

struct ChannelMembersCache {
    members: HashMap<String, String>,
    fetched_at: Instant,
}

/// Queues handed from a dormant connection slot to the connection that
/// resumes it.
pub struct ResumeState {
    pub send_tx: mpsc::Sender<Arc<WebSocketEvent>>,
    pub recv: mpsc::Receiver<Arc<WebSocketEvent>>,
    pub dead_queue: DeadQueue,
    pub reuse_count: i32,
    pub last_user_activity_at: i64,
}

/// One live socket: its send queue, dead queue, sequence counter, and the
/// session/activity state the recipient predicate consults. Owned by
/// exactly one hub shard, keyed by hash(user-id).
pub struct WebConn {
    connection_id: ArcSwap<String>,
    user_id: ArcSwap<String>,
    session: ArcSwapOption<Session>,
    send_tx: mpsc::Sender<Arc<WebSocketEvent>>,
    /// Receiver parked here while no write pump is attached, so a resume
    /// can inherit queued-but-unsent messages.
    recv_slot: Mutex<Option<mpsc::Receiver<Arc<WebSocketEvent>>>>,
    pub dead_queue: Mutex<DeadQueue>,
    /// Next sequence to stamp on an outbound event.
    pub sequence: AtomicI64,
    /// Sequence the client asked to resume from; 0 for a fresh connect.
    requested_seq: AtomicI64,
    active: AtomicBool,
    inactive_since: AtomicI64,
    reuse_count: AtomicI32,
    last_user_activity_at: AtomicI64,
    pub active_channel_id: Mutex<String>,
    pub active_team_id: Mutex<String>,
    pub active_thread_channel_id: Mutex<String>,
    pub active_is_thread_view: AtomicBool,
    channel_members: Mutex<Option<ChannelMembersCache>>,
    last_warn_at: Mutex<HashMap<&'static str, Instant>>,
    closed: CancellationToken,
}

impl WebConn {
    pub fn new(
        user_id: &str,
        session: Option<Arc<Session>>,
        connection_id: String,
        requested_seq: i64,
    ) -> Arc<Self> {
        let (send_tx, recv) = mpsc::channel(SEND_QUEUE_SIZE);
        Arc::new(WebConn {
            connection_id: ArcSwap::from_pointee(connection_id),
            user_id: ArcSwap::from_pointee(user_id.to_string()),
            session: ArcSwapOption::new(session),
            send_tx,
            recv_slot: Mutex::new(Some(recv)),
            dead_queue: Mutex::new(DeadQueue::new()),
            sequence: AtomicI64::new(0),
            requested_seq: AtomicI64::new(requested_seq),
            active: AtomicBool::new(true),
            inactive_since: AtomicI64::new(0),
            reuse_count: AtomicI32::new(0),
            last_user_activity_at: AtomicI64::new(lattice_common::millis()),
            active_channel_id: Mutex::new(String::new()),
            active_team_id: Mutex::new(String::new()),
            active_thread_channel_id: Mutex::new(String::new()),
            active_is_thread_view: AtomicBool::new(false),
            channel_members: Mutex::new(None),
            last_warn_at: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    /// Build a connection that inherits a dormant slot's queues.
    pub fn resumed(
        user_id: &str,
        session: Option<Arc<Session>>,
        connection_id: String,
        requested_seq: i64,
        state: ResumeState,
    ) -> Arc<Self> {
        let conn = WebConn {
            connection_id: ArcSwap::from_pointee(connection_id),
            user_id: ArcSwap::from_pointee(user_id.to_string()),
            session: ArcSwapOption::new(session),
            send_tx: state.send_tx,
            recv_slot: Mutex::new(Some(state.recv)),
            dead_queue: Mutex::new(state.dead_queue),
            sequence: AtomicI64::new(0),
            requested_seq: AtomicI64::new(requested_seq),
            active: AtomicBool::new(true),
            inactive_since: AtomicI64::new(0),
            reuse_count: AtomicI32::new(state.reuse_count),
            last_user_activity_at: AtomicI64::new(state.last_user_activity_at),
            active_channel_id: Mutex::new(String::new()),
            active_team_id: Mutex::new(String::new()),
            active_thread_channel_id: Mutex::new(String::new()),
            active_is_thread_view: AtomicBool::new(false),
            channel_members: Mutex::new(None),
            last_warn_at: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        };
        Arc::new(conn)
    }

    pub fn get_connection_id(&self) -> String {
        self.connection_id.load().as_ref().clone()
    }

    pub fn set_connection_id(&self, id: String) {
        self.connection_id.store(Arc::new(id));
    }

    pub fn user_id(&self) -> String {
        self.user_id.load().as_ref().clone()
    }

    pub fn set_user_id(&self, id: &str) {
        self.user_id.store(Arc::new(id.to_string()));
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.load_full()
    }

    pub fn set_session(&self, session: Option<Arc<Session>>) {
        if let Some(s) = &session {
            self.set_user_id(&s.user_id);
        }
        self.session.store(session);
    }

    /// True iff a non-expired session snapshot is attached.
    pub fn is_authenticated(&self) -> bool {
        self.session
            .load()
            .as_ref()
            .is_some_and(|s| !s.is_expired(lattice_common::millis()))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn mark_active(&self) {
        self.active.store(true, Ordering::Release);
        self.inactive_since.store(0, Ordering::Release);
    }

    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
        self.inactive_since
            .store(lattice_common::millis(), Ordering::Release);
    }

    /// Millis timestamp when the socket detached; 0 while attached.
    pub fn inactive_since(&self) -> i64 {
        self.inactive_since.load(Ordering::Acquire)
    }

    pub fn requested_seq(&self) -> i64 {
        self.requested_seq.load(Ordering::Acquire)
    }

    pub fn reuse_count(&self) -> i32 {
        self.reuse_count.load(Ordering::Acquire)
    }

    pub fn last_user_activity_at(&self) -> i64 {
        self.last_user_activity_at.load(Ordering::Acquire)
    }

    pub fn set_last_user_activity_at(&self, at: i64) {
        self.last_user_activity_at.store(at, Ordering::Release);
    }

    /// Cancellation token observed by both pumps.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Force-close the socket; safe to call from any component.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Number of events currently queued for the write pump.
    pub fn queue_depth(&self) -> usize {
        self.send_tx.max_capacity() - self.send_tx.capacity()
    }

    /// Non-blocking enqueue used by the hub. A full queue is the caller's
    /// signal to close and evict this connection.
    pub fn try_enqueue(&self, ev: Arc<WebSocketEvent>) -> Result<(), ()> {
        self.send_tx.try_send(ev).map_err(|_| ())
    }

    /// Detach the receiver for a write pump (or a resume). `None` when a
    /// pump is already attached.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Arc<WebSocketEvent>>> {
        self.recv_slot.lock().take()
    }

    /// Park the receiver when the write pump exits so its unsent messages
    /// survive for a resume.
    pub fn park_receiver(&self, recv: mpsc::Receiver<Arc<WebSocketEvent>>) {
        *self.recv_slot.lock() = Some(recv);
    }

    /// Extract everything a resuming connection inherits. Called by the
    /// hub loop after removing this (inactive) connection from its index.
    pub fn extract_resume_state(&self) -> Option<ResumeState> {
        let recv = self.take_receiver()?;
        let dead_queue = std::mem::take(&mut *self.dead_queue.lock());
        Some(ResumeState {
            send_tx: self.send_tx.clone(),
            recv,
            dead_queue,
            reuse_count: self.reuse_count.load(Ordering::Acquire) + 1,
            last_user_activity_at: self.last_user_activity_at(),
        })
    }

    /// Drop the session snapshot and membership cache so they are
    /// re-fetched; used on session invalidation.
    pub fn invalidate_cache(&self) {
        self.session.store(None);
        *self.channel_members.lock() = None;
    }

    /// Rate-limited warning gate: true at most once per minute per kind.
    pub fn should_warn(&self, kind: &'static str) -> bool {
        let mut warns = self.last_warn_at.lock();
        let now = Instant::now();
        match warns.get(kind) {
            Some(at) if now.duration_since(*at) < WARN_INTERVAL => false,
            _ => {
                warns.insert(kind, now);
                true
            }
        }
    }

    /// Channel membership with a 30-minute cache, fetched through the
    /// channel store on miss.
    pub async fn is_member_of_channel(&self, channel_id: &str, stores: &Stores) -> bool {
        {
            let cache = self.channel_members.lock();
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < CHANNEL_MEMBERS_TTL {
                    return c.members.contains_key(channel_id);
                }
            }
        }

        let members = match stores
            .channel
            .get_all_channel_members_for_user(&self.user_id())
            .await
        {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(
                    user_id = %self.user_id(),
                    error = %err,
                    "failed to fetch channel members for websocket fan-out"
                );
                return false;
            }
        };

        let is_member = members.contains_key(channel_id);
        *self.channel_members.lock() = Some(ChannelMembersCache {
            members,
            fetched_at: Instant::now(),
        });
        is_member
    }

    /// The recipient predicate applied to every broadcast, in rule order.
    pub async fn should_send_event(
        &self,
        ev: &WebSocketEvent,
        stores: &Stores,
        metrics: &WebSocketMetrics,
    ) -> bool {
        // 1. Unauthenticated connections receive nothing.
        if !self.is_authenticated() {
            return false;
        }

        // 2. Slow connection: shed non-critical events.
        if self.queue_depth() >= SEND_SLOW_THRESHOLD && is_non_critical(ev.event_type()) {
            inc(&metrics.events_shed_slow);
            if self.should_warn("slow") {
                tracing::warn!(
                    user_id = %self.user_id(),
                    connection_id = %self.get_connection_id(),
                    event = ev.event_type(),
                    "websocket queue slow; dropping non-critical event"
                );
            }
            return false;
        }

        let session = match self.session() {
            Some(s) => s,
            None => return false,
        };
        let is_admin = session.is_system_admin();

        // 3. Admins get the unsanitized copy instead.
        if ev.broadcast().contains_sanitized_data && is_admin {
            return false;
        }
        // 4. Sensitive data is for admins only.
        if ev.broadcast().contains_sensitive_data && !is_admin {
            return false;
        }

        let conn_id = self.get_connection_id();
        // 5. Targeted at one connection.
        if !ev.broadcast().connection_id.is_empty() {
            return ev.broadcast().connection_id == conn_id;
        }
        // 6. Originating connection asked to be skipped.
        if !ev.broadcast().omit_connection_id.is_empty()
            && ev.broadcast().omit_connection_id == conn_id
        {
            return false;
        }

        let user_id = self.user_id();
        // 7. Targeted at one user.
        if !ev.broadcast().user_id.is_empty() {
            return ev.broadcast().user_id == user_id;
        }
        // 8. Explicitly omitted users.
        if ev.broadcast().omit_users.contains(&user_id) {
            return false;
        }
        // 9. Channel-scoped events require membership.
        if !ev.broadcast().channel_id.is_empty()
            && !self
                .is_member_of_channel(&ev.broadcast().channel_id, stores)
                .await
        {
            return false;
        }
        // 10. Team-scoped events require team membership.
        if !ev.broadcast().team_id.is_empty() && !session.belongs_to_team(&ev.broadcast().team_id)
        {
            return false;
        }

        // 11. Guest visibility on user events.
        if session.is_guest() && !self.guest_can_see_event(ev, stores).await {
            return false;
        }

        true
    }

    async fn guest_can_see_event(&self, ev: &WebSocketEvent, stores: &Stores) -> bool {
        if ev.event_type() != event_type::USER_UPDATED && ev.event_type() != event_type::NEW_USER
        {
            return true;
        }
        let subject = ev
            .data()
            .get("user_id")
            .and_then(|v| v.as_str())
            .or_else(|| {
                ev.data()
                    .get("user")
                    .and_then(|u| u.get("id"))
                    .and_then(|v| v.as_str())
            });
        let Some(subject) = subject else {
            return true;
        };
        stores
            .user
            .can_see_user(&self.user_id(), subject)
            .await
            .unwrap_or(false)
    }
}
