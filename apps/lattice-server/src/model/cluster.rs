//! Typed inter-node messages for the cluster event plane.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The closed set of cluster event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterEvent {
    Publish,
    UpdateStatus,
    InvalidateAllCaches,
    InvalidateWebconnCacheForUser,
    ClearSessionCacheForUser,
    ClearSessionCacheForAllUsers,
    BusyStateChanged,
    PluginEvent,
}

/// Delivery contract on the cluster transport. Reliable demands
/// at-least-once delivery to every other node; best-effort allows drops
/// under pressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSendType {
    #[default]
    BestEffort,
    Reliable,
}

/// One message on the inter-node plane. `data` is JSON for status and
/// broadcast payloads and a raw string for user-id-only events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub event: ClusterEvent,
    #[serde(default)]
    pub send_type: ClusterSendType,
    #[serde(default)]
    pub wait_for_all: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub props: HashMap<String, String>,
    #[serde(default, with = "serde_bytes_vec")]
    pub data: Vec<u8>,
}

impl ClusterMessage {
    pub fn new(event: ClusterEvent, send_type: ClusterSendType, data: Vec<u8>) -> Self {
        ClusterMessage {
            event,
            send_type,
            wait_for_all: false,
            props: HashMap::new(),
            data,
        }
    }
}

/// `data` travels as base64 inside the JSON envelope.
mod serde_bytes_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
