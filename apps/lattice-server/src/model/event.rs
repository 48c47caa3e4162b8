//! Server-originated websocket events and their broadcast envelopes.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type names carried on the wire.
pub mod event_type {
    pub const HELLO: &str = "hello";
    pub const POSTED: &str = "posted";
    pub const POST_EDITED: &str = "post_edited";
    pub const TYPING: &str = "typing";
    pub const STATUS_CHANGE: &str = "status_change";
    pub const CHANNEL_VIEWED: &str = "channel_viewed";
    pub const USER_UPDATED: &str = "user_updated";
    pub const NEW_USER: &str = "new_user";
    pub const DIRECT_ADDED: &str = "direct_added";
    pub const GROUP_ADDED: &str = "group_added";
    pub const ADDED_TO_TEAM: &str = "added_to_team";
    pub const STATUS_LOG: &str = "status_log";
    pub const CONFIG_CHANGED: &str = "config_changed";
    pub const LICENSE_CHANGED: &str = "license_changed";
    pub const RESPONSE: &str = "response";
}

/// Events shed when a connection's send queue passes the slow threshold,
/// and when the server-busy governor is set.
pub fn is_non_critical(event: &str) -> bool {
    matches!(
        event,
        event_type::TYPING | event_type::STATUS_CHANGE | event_type::CHANNEL_VIEWED
    )
}

/// Events that demand reliable cluster delivery regardless of the
/// producer's `reliable_cluster_send` flag.
pub fn requires_reliable_cluster_send(event: &str) -> bool {
    matches!(
        event,
        event_type::POSTED
            | event_type::POST_EDITED
            | event_type::DIRECT_ADDED
            | event_type::GROUP_ADDED
            | event_type::ADDED_TO_TEAM
    )
}

/// Targeting fields attached to every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Broadcast {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub omit_connection_id: String,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub omit_users: HashSet<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team_id: String,
    /// Event data was sanitized for regular users; admins get a separate
    /// unsanitized copy, so drop this one for them.
    #[serde(default)]
    pub contains_sanitized_data: bool,
    /// Event data is for admins only.
    #[serde(default)]
    pub contains_sensitive_data: bool,
    /// Producer demands at-least-once delivery to peer nodes.
    #[serde(default)]
    pub reliable_cluster_send: bool,
}

/// A hook the producer asked to run per-recipient during fan-out.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub hook_id: String,
    pub args: Map<String, Value>,
}

/// JSON fragments computed once per broadcast; the per-connection sequence
/// is spliced in at write time.
#[derive(Debug)]
pub struct PrecomputedJson {
    event: String,
    data: String,
    broadcast: String,
}

impl PrecomputedJson {
    pub fn frame(&self, seq: i64) -> String {
        format!(
            "{{\"event\":{},\"data\":{},\"broadcast\":{},\"seq\":{}}}",
            self.event, self.data, self.broadcast, seq
        )
    }
}

/// The wire shape of a server → client event frame.
#[derive(Serialize, Deserialize)]
struct WireEvent {
    event: String,
    data: Map<String, Value>,
    broadcast: Broadcast,
    #[serde(default)]
    seq: i64,
}

/// A server-originated event flowing through the hub to recipients.
#[derive(Debug, Clone)]
pub struct WebSocketEvent {
    event: String,
    data: Map<String, Value>,
    broadcast: Broadcast,
    sequence: i64,
    precomputed: Option<Arc<PrecomputedJson>>,
    hooks: Vec<HookInvocation>,
}

impl WebSocketEvent {
    pub fn new(event: &str, broadcast: Broadcast) -> Self {
        WebSocketEvent {
            event: event.to_string(),
            data: Map::new(),
            broadcast,
            sequence: 0,
            precomputed: None,
            hooks: Vec::new(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event
    }

    pub fn broadcast(&self) -> &Broadcast {
        &self.broadcast
    }

    pub fn broadcast_mut(&mut self) -> &mut Broadcast {
        self.precomputed = None;
        &mut self.broadcast
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Adds a data field, invalidating any precomputed JSON.
    pub fn add(&mut self, key: &str, value: impl Into<Value>) {
        self.precomputed = None;
        self.data.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.add(key, value);
        self
    }

    pub fn hooks(&self) -> &[HookInvocation] {
        &self.hooks
    }

    pub fn add_hook(&mut self, hook_id: &str, args: Map<String, Value>) {
        self.hooks.push(HookInvocation {
            hook_id: hook_id.to_string(),
            args,
        });
    }

    /// Deep copy for per-recipient hook mutation. The copy deliberately
    /// drops the precomputed JSON so mutations are re-encoded.
    pub fn deep_copy(&self) -> Self {
        WebSocketEvent {
            event: self.event.clone(),
            data: self.data.clone(),
            broadcast: self.broadcast.clone(),
            sequence: self.sequence,
            precomputed: None,
            hooks: self.hooks.clone(),
        }
    }

    /// Serializes the event and broadcast once so the hub's fan-out only
    /// pays the encoding cost a single time per broadcast.
    pub fn precompute(&mut self) {
        let event = serde_json::to_string(&self.event).unwrap_or_else(|_| "\"\"".to_string());
        let data = serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".to_string());
        let broadcast =
            serde_json::to_string(&self.broadcast).unwrap_or_else(|_| "{}".to_string());
        self.precomputed = Some(Arc::new(PrecomputedJson {
            event,
            data,
            broadcast,
        }));
    }

    pub fn is_precomputed(&self) -> bool {
        self.precomputed.is_some()
    }

    /// Encodes the frame sent to one connection, stamped with its sequence.
    pub fn encode_frame(&self, seq: i64) -> Result<String, serde_json::Error> {
        if let Some(pre) = &self.precomputed {
            return Ok(pre.frame(seq));
        }
        serde_json::to_string(&WireEvent {
            event: self.event.clone(),
            data: self.data.clone(),
            broadcast: self.broadcast.clone(),
            seq,
        })
    }

    /// JSON used on the cluster plane; carries no sequence.
    pub fn to_cluster_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireEvent {
            event: self.event.clone(),
            data: self.data.clone(),
            broadcast: self.broadcast.clone(),
            seq: 0,
        })
    }

    pub fn from_cluster_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let wire: WireEvent = serde_json::from_slice(bytes)?;
        Ok(WebSocketEvent {
            event: wire.event,
            data: wire.data,
            broadcast: wire.broadcast,
            sequence: 0,
            precomputed: None,
            hooks: Vec::new(),
        })
    }
}
