use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chat frame, in either direction.
///
/// Server-produced frames always carry `timestamp`; client frames need not.
/// Denials and protocol errors use the `error` field, everything else rides
/// in `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Server frame carrying a payload.
    pub fn event(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            error: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Generic error frame, reported to the sender only.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            data: None,
            error: Some(message.into()),
            timestamp: Some(Utc::now()),
        }
    }

    /// Burst-tier denial frame.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: "rate_limit".to_string(),
            data: None,
            error: Some(message.into()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// `join` payload from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

/// `message` payload from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub message: String,
}

/// `typing` payload from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    #[serde(default)]
    pub is_typing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_frame_sets_timestamp_and_skips_error() {
        let frame = Envelope::event("message", json!({"message": "hi"}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["message"], "hi");
        assert!(value["timestamp"].as_str().is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_error_frame_uses_error_field() {
        let frame = Envelope::error("Unknown message type");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "Unknown message type");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_rate_limit_frame() {
        let frame = Envelope::rate_limited("RATE_LIMIT");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "rate_limit");
        assert_eq!(value["error"], "RATE_LIMIT");
    }

    #[test]
    fn test_client_frame_without_timestamp_parses() {
        let frame: Envelope =
            serde_json::from_str(r#"{"type":"join","data":{"userId":"u1","username":"Ann"}}"#)
                .unwrap();
        assert_eq!(frame.kind, "join");
        assert!(frame.timestamp.is_none());

        let join: JoinData = serde_json::from_value(frame.data.unwrap()).unwrap();
        assert_eq!(join.user_id, "u1");
        assert_eq!(join.username, "Ann");
    }

    #[test]
    fn test_join_data_defaults_missing_fields_to_empty() {
        let join: JoinData = serde_json::from_value(json!({})).unwrap();
        assert!(join.user_id.is_empty());
        assert!(join.username.is_empty());
    }

    #[test]
    fn test_typing_data() {
        let typing: TypingData = serde_json::from_value(json!({"isTyping": true})).unwrap();
        assert!(typing.is_typing);
    }
}
