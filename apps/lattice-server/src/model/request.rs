//! Client → server websocket frames and router replies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded client frame: JSON on text frames, MessagePack on binary
/// frames; both share this shape.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketRequest {
    pub action: String,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Router reply to a client request, correlated by `seq_reply`.
#[derive(Debug, Serialize)]
pub struct WebSocketResponse {
    pub status: &'static str,
    pub seq_reply: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebSocketResponse {
    pub fn ok(seq_reply: i64) -> Self {
        WebSocketResponse {
            status: "OK",
            seq_reply,
            data: None,
            error: None,
        }
    }

    pub fn fail(seq_reply: i64, error: impl Into<String>) -> Self {
        WebSocketResponse {
            status: "FAIL",
            seq_reply,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Payload of the `authentication_challenge` action.
#[derive(Debug, Deserialize)]
pub struct AuthChallenge {
    pub token: String,
}

/// Payload of the `presence_indicator` action.
#[derive(Debug, Default, Deserialize)]
pub struct PresenceIndicator {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub thread_channel_id: String,
    #[serde(default)]
    pub is_thread_view: bool,
    #[serde(default)]
    pub window_active: bool,
    #[serde(default)]
    pub device: String,
}

/// Payload of the `user_typing` action.
#[derive(Debug, Default, Deserialize)]
pub struct TypingIndicator {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub parent_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_json_request() {
        let req: WebSocketRequest = serde_json::from_str(
            r#"{"action":"presence_indicator","seq":3,"data":{"channel_id":"ch1","window_active":true}}"#,
        )
        .unwrap();
        assert_eq!(req.action, "presence_indicator");
        assert_eq!(req.seq, 3);

        let ind: PresenceIndicator =
            serde_json::from_value(Value::Object(req.data)).unwrap();
        assert_eq!(ind.channel_id, "ch1");
        assert!(ind.window_active);
    }

    #[test]
    fn decodes_msgpack_request() {
        let json = serde_json::json!({
            "action": "authentication_challenge",
            "seq": 1,
            "data": {"token": "tok123"}
        });
        let bytes = rmp_serde::to_vec_named(&json).unwrap();
        let req: WebSocketRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(req.action, "authentication_challenge");
        assert_eq!(req.data["token"], "tok123");
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_value(WebSocketResponse::ok(4)).unwrap();
        assert_eq!(ok["status"], "OK");
        assert_eq!(ok["seq_reply"], 4);
        assert!(ok.get("error").is_none());

        let fail = serde_json::to_value(WebSocketResponse::fail(5, "bad token")).unwrap();
        assert_eq!(fail["status"], "FAIL");
        assert_eq!(fail["error"], "bad token");
    }
}
