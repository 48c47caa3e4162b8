//! Per-connection read and write pumps.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::timeout;

use crate::hub::conn::WebConn;
use crate::model::event::{event_type, Broadcast};
use crate::model::request::{AuthChallenge, PresenceIndicator, TypingIndicator, WebSocketResponse};
use crate::model::status_log::{StatusLogReason, DEVICE_UNKNOWN};
use crate::model::{WebSocketEvent, WebSocketRequest, PLUGIN_ACTION_PREFIX};
use crate::PlatformService;

use super::ResumePlan;

/// Reserved client actions.
pub const ACTION_AUTH_CHALLENGE: &str = "authentication_challenge";
pub const ACTION_PRESENCE_INDICATOR: &str = "presence_indicator";
pub const ACTION_USER_TYPING: &str = "user_typing";

/// The client must produce a frame (or pong) within this window.
const READ_DEADLINE: Duration = Duration::from_secs(100);
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the check that closes still-unauthenticated sockets.
const AUTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drains the send queue onto the socket, stamping sequences and feeding
/// the dead queue. On exit the receiver is parked back on the connection
/// so a resume inherits whatever was still queued.
pub async fn write_pump(
    platform: Arc<PlatformService>,
    conn: Arc<WebConn>,
    mut ws_tx: WsSink,
    plan: ResumePlan,
) {
    let Some(mut recv) = conn.take_receiver() else {
        tracing::warn!(connection_id = %conn.get_connection_id(),
            "write pump started without a receiver");
        conn.close();
        return;
    };

    let opening_ok = match plan {
        ResumePlan::Fresh | ResumePlan::Lossless => true,
        ResumePlan::Replay { from_index } => replay(&conn, &mut ws_tx, from_index).await,
        ResumePlan::Reset => {
            let hello = platform.hello_event(&conn);
            send_event(&platform, &conn, &mut ws_tx, &hello).await
        }
    };

    if opening_ok {
        let mut ping_tick = tokio::time::interval(PING_INTERVAL);
        let mut auth_tick = tokio::time::interval(AUTH_CHECK_INTERVAL);
        // The first tick of an interval fires immediately; skip both.
        ping_tick.tick().await;
        auth_tick.tick().await;

        loop {
            tokio::select! {
                _ = conn.closed().cancelled() => break,
                ev = recv.recv() => {
                    let Some(ev) = ev else { break };
                    if !send_event(&platform, &conn, &mut ws_tx, &ev).await {
                        break;
                    }
                }
                _ = ping_tick.tick() => {
                    let ping = Message::Ping(Vec::new().into());
                    if timeout(WRITE_TIMEOUT, ws_tx.send(ping)).await.is_err() {
                        break;
                    }
                }
                _ = auth_tick.tick() => {
                    if !conn.is_authenticated() {
                        tracing::debug!(connection_id = %conn.get_connection_id(),
                            "closing unauthenticated websocket");
                        break;
                    }
                }
            }
        }
    }

    conn.park_receiver(recv);
    conn.close();
}

/// Replay dead-queue frames, in order, starting at `from_index`. The
/// frames carry their original sequences.
async fn replay(conn: &WebConn, ws_tx: &mut WsSink, from_index: usize) -> bool {
    let frames: Vec<String> = {
        let dq = conn.dead_queue.lock();
        let mut out = Vec::new();
        dq.drain_from(from_index, |item| out.push(item.frame.clone()));
        out
    };
    tracing::debug!(
        connection_id = %conn.get_connection_id(),
        replayed = frames.len(),
        "replaying missed frames"
    );
    for frame in frames {
        match timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(frame.into()))).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
    }
    true
}

async fn send_event(
    platform: &PlatformService,
    conn: &WebConn,
    ws_tx: &mut WsSink,
    ev: &WebSocketEvent,
) -> bool {
    let processed = platform.apply_broadcast_hooks(conn, ev);
    let seq = conn.sequence.fetch_add(1, Ordering::AcqRel);
    let frame = match processed.encode_frame(seq) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, event = ev.event_type(), "failed to encode frame");
            return true;
        }
    };
    conn.dead_queue.lock().push(seq, frame.clone());
    matches!(
        timeout(WRITE_TIMEOUT, ws_tx.send(Message::Text(frame.into()))).await,
        Ok(Ok(()))
    )
}

/// Consumes client frames until the socket closes, errors, or goes silent
/// past the read deadline.
pub async fn read_pump(platform: Arc<PlatformService>, conn: Arc<WebConn>, mut ws_rx: WsStream) {
    loop {
        let msg = match timeout(READ_DEADLINE, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!(connection_id = %conn.get_connection_id(),
                    "websocket read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(error = ?err, connection_id = %conn.get_connection_id(),
                    "websocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<WebSocketRequest>(&text) {
                Ok(req) => route(&platform, &conn, req).await,
                Err(err) => {
                    tracing::debug!(error = %err, "dropping undecodable text frame");
                }
            },
            Message::Binary(bytes) => match rmp_serde::from_slice::<WebSocketRequest>(&bytes) {
                Ok(req) => route(&platform, &conn, req).await,
                Err(err) => {
                    tracing::debug!(error = %err, "dropping undecodable binary frame");
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                on_client_heartbeat(&platform, &conn).await;
            }
            Message::Close(_) => break,
        }
    }
    conn.close();
}

/// Pongs count as liveness but also as (weak) presence activity.
async fn on_client_heartbeat(platform: &PlatformService, conn: &WebConn) {
    if !conn.is_authenticated() {
        return;
    }
    conn.set_last_user_activity_at(lattice_common::millis());
    platform
        .set_status_away_if_needed(&conn.user_id(), false)
        .await;
    platform.set_online_if_no_offline(&conn.user_id()).await;
    if let Some(session) = conn.session() {
        platform.update_last_activity_at_if_needed(&session).await;
    }
}

async fn route(platform: &Arc<PlatformService>, conn: &Arc<WebConn>, req: WebSocketRequest) {
    if req.action.starts_with(PLUGIN_ACTION_PREFIX) {
        // Plugin actions bypass the router and get no reply.
        platform.dispatch_plugin_action(&conn.user_id(), &req);
        return;
    }
    match req.action.as_str() {
        ACTION_AUTH_CHALLENGE => handle_auth_challenge(platform, conn, req).await,
        ACTION_PRESENCE_INDICATOR => handle_presence_indicator(platform, conn, req).await,
        ACTION_USER_TYPING => handle_user_typing(platform, conn, req).await,
        other => {
            tracing::debug!(action = other, "unknown websocket action");
            respond(conn, WebSocketResponse::fail(req.seq, "unknown action"));
        }
    }
}

async fn handle_auth_challenge(
    platform: &Arc<PlatformService>,
    conn: &Arc<WebConn>,
    req: WebSocketRequest,
) {
    if conn.is_authenticated() {
        respond(conn, WebSocketResponse::ok(req.seq));
        return;
    }
    let challenge: AuthChallenge = match serde_json::from_value(Value::Object(req.data)) {
        Ok(c) => c,
        Err(_) => {
            respond(conn, WebSocketResponse::fail(req.seq, "missing token"));
            conn.close();
            return;
        }
    };
    match platform.get_session(&challenge.token).await {
        Ok(session) if !session.is_expired(lattice_common::millis()) => {
            conn.set_session(Some(session));
            platform
                .hub_pool()
                .pick_hub(&conn.user_id())
                .register(conn.clone())
                .await;
            respond(conn, WebSocketResponse::ok(req.seq));
        }
        _ => {
            respond(conn, WebSocketResponse::fail(req.seq, "invalid token"));
            conn.close();
        }
    }
}

async fn handle_presence_indicator(
    platform: &Arc<PlatformService>,
    conn: &Arc<WebConn>,
    req: WebSocketRequest,
) {
    if !conn.is_authenticated() {
        respond(conn, WebSocketResponse::fail(req.seq, "not authenticated"));
        return;
    }
    let indicator: PresenceIndicator = match serde_json::from_value(Value::Object(req.data)) {
        Ok(i) => i,
        Err(_) => {
            respond(conn, WebSocketResponse::fail(req.seq, "invalid presence indicator"));
            return;
        }
    };

    *conn.active_channel_id.lock() = indicator.channel_id.clone();
    *conn.active_team_id.lock() = indicator.team_id.clone();
    *conn.active_thread_channel_id.lock() = indicator.thread_channel_id.clone();
    conn.active_is_thread_view
        .store(indicator.is_thread_view, Ordering::Release);
    if indicator.window_active && !indicator.channel_id.is_empty() {
        conn.set_last_user_activity_at(lattice_common::millis());
    }

    platform
        .update_activity_from_heartbeat(&conn.user_id(), &indicator)
        .await;
    if let Some(session) = conn.session() {
        platform.update_last_activity_at_if_needed(&session).await;
    }
    respond(conn, WebSocketResponse::ok(req.seq));
}

/// Typing fans out to the channel, everyone but the sender, and counts
/// as explicit user activity.
async fn handle_user_typing(
    platform: &Arc<PlatformService>,
    conn: &Arc<WebConn>,
    req: WebSocketRequest,
) {
    if !conn.is_authenticated() {
        respond(conn, WebSocketResponse::fail(req.seq, "not authenticated"));
        return;
    }
    let typing: TypingIndicator = match serde_json::from_value::<TypingIndicator>(Value::Object(req.data)) {
        Ok(t) if !t.channel_id.is_empty() => t,
        _ => {
            respond(conn, WebSocketResponse::fail(req.seq, "missing channel_id"));
            return;
        }
    };

    let user_id = conn.user_id();
    let ev = WebSocketEvent::new(
        event_type::TYPING,
        Broadcast {
            channel_id: typing.channel_id.clone(),
            omit_users: [user_id.clone()].into_iter().collect(),
            ..Default::default()
        },
    )
    .with("user_id", user_id.as_str())
    .with("parent_id", typing.parent_id.as_str());
    platform.publish(ev).await;

    platform
        .update_activity_from_manual_action(
            &user_id,
            &typing.channel_id,
            DEVICE_UNKNOWN,
            StatusLogReason::Websocket,
        )
        .await;
    respond(conn, WebSocketResponse::ok(req.seq));
}

/// Router replies travel the send queue as `response` events so they get
/// sequenced and dead-queued like any other frame.
fn respond(conn: &WebConn, resp: WebSocketResponse) {
    let data = match serde_json::to_value(&resp) {
        Ok(Value::Object(map)) => map,
        _ => return,
    };
    let mut ev = WebSocketEvent::new(
        event_type::RESPONSE,
        Broadcast {
            connection_id: conn.get_connection_id(),
            ..Default::default()
        },
    );
    for (k, v) in data {
        ev.add(&k, v);
    }
    if conn.try_enqueue(Arc::new(ev)).is_err() {
        tracing::warn!(connection_id = %conn.get_connection_id(),
            "dropping router reply; send queue full");
    }
}
