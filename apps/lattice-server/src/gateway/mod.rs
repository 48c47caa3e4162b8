//! WebSocket upgrade handler and connection lifecycle.

pub mod pump;

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::hub::conn::{ResumeState, WebConn};
use crate::metrics::inc;
use crate::model::Session;
use crate::PlatformService;

/// Query parameters recognized on the upgrade URL.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// What the write pump does before entering its normal loop.
#[derive(Debug)]
pub enum ResumePlan {
    /// New connection; the hub sends `hello` on registration.
    Fresh,
    /// Resumed with zero missed events.
    Lossless,
    /// Resumed; replay dead-queue frames starting at this slot.
    Replay { from_index: usize },
    /// Requested sequence already overwritten; state was reset and the
    /// pump opens with a fresh `hello`.
    Reset,
}

pub fn router() -> Router<Arc<PlatformService>> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(platform): State<Arc<PlatformService>>,
) -> impl IntoResponse {
    let token = params.token.clone().or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| handle_socket(socket, platform, params, token))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Validated resume request: a well-formed connection id plus a
/// non-negative decimal sequence.
fn resume_request(params: &ConnectParams) -> Option<(String, i64)> {
    let connection_id = params.connection_id.as_deref()?;
    if !lattice_common::id::is_valid_id(connection_id) {
        return None;
    }
    let seq: i64 = params.sequence.as_deref()?.parse().ok()?;
    if seq < 0 {
        return None;
    }
    Some((connection_id.to_string(), seq))
}

async fn handle_socket(
    socket: WebSocket,
    platform: Arc<PlatformService>,
    params: ConnectParams,
    token: Option<String>,
) {
    let session = match token {
        Some(token) => match platform.get_session(&token).await {
            Ok(s) if !s.is_expired(lattice_common::millis()) => Some(s),
            Ok(_) | Err(_) => {
                tracing::debug!("websocket upgrade with invalid token; awaiting challenge");
                None
            }
        },
        None => None,
    };

    let (conn, plan) = open_connection(&platform, session, &params).await;

    // Unauthenticated sockets get registered after a successful
    // authentication challenge instead.
    if conn.is_authenticated() {
        platform
            .hub_pool()
            .pick_hub(&conn.user_id())
            .register(conn.clone())
            .await;
    }

    let (ws_tx, ws_rx) = socket.split();
    let write = tokio::spawn(pump::write_pump(
        platform.clone(),
        conn.clone(),
        ws_tx,
        plan,
    ));
    pump::read_pump(platform.clone(), conn.clone(), ws_rx).await;
    conn.close();
    let _ = write.await;

    conn.mark_inactive();
    if conn.is_authenticated() {
        platform
            .hub_pool()
            .pick_hub(&conn.user_id())
            .deactivate(conn.clone())
            .await;
    }
    tracing::info!(
        user_id = %conn.user_id(),
        connection_id = %conn.get_connection_id(),
        "websocket connection ended"
    );
}

/// Build the connection, adopting a dormant slot's queues when the client
/// asked to resume and the slot is still within the replay window.
pub async fn open_connection(
    platform: &Arc<PlatformService>,
    session: Option<Arc<Session>>,
    params: &ConnectParams,
) -> (Arc<WebConn>, ResumePlan) {
    let user_id = session.as_ref().map(|s| s.user_id.clone()).unwrap_or_default();

    if let Some((connection_id, wanted_seq)) = resume_request(params) {
        if !user_id.is_empty() {
            if let Some(state) = platform
                .hub_pool()
                .pick_hub(&user_id)
                .check_conn(&user_id, &connection_id)
                .await
            {
                return adopt(platform, &user_id, session, connection_id, wanted_seq, state);
            }
        }
        // Unknown connection id: fall through to a fresh connection. The
        // client finds out through the `hello` frame.
    }

    let conn = WebConn::new(
        &user_id,
        session,
        lattice_common::id::prefixed_ulid("conn"),
        0,
    );
    (conn, ResumePlan::Fresh)
}

fn adopt(
    platform: &Arc<PlatformService>,
    user_id: &str,
    session: Option<Arc<Session>>,
    connection_id: String,
    wanted_seq: i64,
    mut state: ResumeState,
) -> (Arc<WebConn>, ResumePlan) {
    let metrics = &platform.metrics;

    if !state.dead_queue.has_msg_loss(wanted_seq) {
        inc(&metrics.reconnect_lossless);
        let conn = WebConn::resumed(user_id, session, connection_id, wanted_seq, state);
        conn.sequence
            .store(wanted_seq, std::sync::atomic::Ordering::Release);
        return (conn, ResumePlan::Lossless);
    }

    if let Some(from_index) = state.dead_queue.index_of(wanted_seq) {
        inc(&metrics.reconnect_found);
        let next_seq = state.dead_queue.last_seq().map(|s| s + 1).unwrap_or(0);
        let conn = WebConn::resumed(user_id, session, connection_id, wanted_seq, state);
        conn.sequence
            .store(next_seq, std::sync::atomic::Ordering::Release);
        return (conn, ResumePlan::Replay { from_index });
    }

    // The wanted sequence fell out of the replay window. Keep the queued
    // messages but hand the client a brand-new identity.
    inc(&metrics.reconnect_notfound);
    state.dead_queue.clear();
    let conn = WebConn::resumed(
        user_id,
        session,
        lattice_common::id::prefixed_ulid("conn"),
        0,
        state,
    );
    (conn, ResumePlan::Reset)
}
