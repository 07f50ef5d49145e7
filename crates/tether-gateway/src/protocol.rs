//! Gateway wire protocol: JSON frames on the socket and control-plane bodies
//!
//! Every socket frame is an object tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{CompletionRequest, CompletionResult, UserIdentity};

use crate::error::GatewayError;

/// Client → Gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Run a completion
    Complete {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        request: CompletionRequest,
    },
    /// Manual token entry when the pushed handshake did not arrive
    Authenticate { token: String },
    Ping,
}

/// Gateway → Client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Authenticated {
        user: UserIdentity,
    },
    Chunk {
        #[serde(rename = "requestId")]
        request_id: String,
        text: String,
    },
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        result: CompletionResult,
    },
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(request_id: Option<String>, err: &GatewayError) -> Self {
        Self::Error {
            request_id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","kind":"Internal","message":"failed to encode frame"}"#.to_string()
        })
    }
}

/// Parse a client frame. On failure, recover the `requestId` (if any) so the
/// error envelope can still be correlated.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, (Option<String>, GatewayError)> {
    serde_json::from_str(raw).map_err(|e| {
        let request_id = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.get("requestId")?.as_str().map(str::to_string));
        (
            request_id,
            GatewayError::InvalidRequest(format!("unreadable frame: {}", e)),
        )
    })
}

// ── Control-plane bodies ──

/// `POST /auth`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverTokenBody {
    pub connection_id: String,
    pub token: String,
    /// Identity snapshot from the login flow; looked up in the account store
    /// when absent
    #[serde(default)]
    pub user_data: Option<UserIdentity>,
}

/// `POST /auth` success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverTokenResponse {
    pub status: String,
    pub connection_id: String,
    pub user_id: String,
}

/// `POST /auth/tokens`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintTokenBody {
    pub user_id: String,
}

/// `POST /auth/tokens` success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintedToken {
    pub token: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Error body for every non-2xx control-plane response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub connections: usize,
    pub providers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_deserialize() {
        let raw = r#"{
            "type": "complete",
            "requestId": "r-1",
            "provider": "anthropic",
            "model": "claude-3-7-sonnet-20250219",
            "messages": [{"role": "user", "content": "Hello, world!"}],
            "temperature": 0.7,
            "streaming": true
        }"#;
        match parse_client_message(raw).unwrap() {
            ClientMessage::Complete {
                request_id,
                request,
            } => {
                assert_eq!(request_id, "r-1");
                assert_eq!(request.provider, "anthropic");
                assert_eq!(request.messages.len(), 1);
                assert!(request.streaming);
                assert!(request.tools.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_authenticate_and_ping() {
        assert_eq!(
            parse_client_message(r#"{"type":"authenticate","token":"abc"}"#).unwrap(),
            ClientMessage::Authenticate {
                token: "abc".into()
            }
        );
        assert_eq!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_bad_frame_keeps_request_id() {
        let (request_id, err) =
            parse_client_message(r#"{"type":"complete","requestId":"r-9"}"#).unwrap_err();
        assert_eq!(request_id.as_deref(), Some("r-9"));
        assert_eq!(err.kind(), "InvalidRequest");

        let (request_id, _) = parse_client_message("not json").unwrap_err();
        assert!(request_id.is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(parse_client_message(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_server_frames_serialize() {
        let chunk = ServerMessage::Chunk {
            request_id: "r-1".into(),
            text: "Hel".into(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "chunk", "requestId": "r-1", "text": "Hel"})
        );

        let result = ServerMessage::Result {
            request_id: "r-1".into(),
            result: CompletionResult {
                text: "Hello".into(),
                tokens_used: 8,
                credits_used: 0.008,
                tool_call: None,
                truncated: false,
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["tokensUsed"], 8);
        assert_eq!(value["creditsUsed"], 0.008);
        assert!(value.get("toolCall").is_none());

        let authenticated = ServerMessage::Authenticated {
            user: UserIdentity::new("user-42", "a@example.com", 5.0),
        };
        let value = serde_json::to_value(&authenticated).unwrap();
        assert_eq!(value["type"], "authenticated");
        assert_eq!(value["user"]["userId"], "user-42");

        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_error_frame() {
        let frame = ServerMessage::error(None, &GatewayError::Unauthorized("not signed in".into()));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "Unauthorized");
        assert!(value.get("requestId").is_none());
    }

    #[test]
    fn test_server_frames_roundtrip_for_clients() {
        let raw = r#"{"type":"result","requestId":"r","text":"hi","tokensUsed":3,"creditsUsed":0.003,"toolCall":{"id":"call_1","name":"lookup","parameters":{"q":"x"}}}"#;
        let parsed: ServerMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            ServerMessage::Result { result, .. } => {
                assert_eq!(result.tool_call.unwrap().name, "lookup");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deliver_body_optional_user_data() {
        let body: DeliverTokenBody =
            serde_json::from_str(r#"{"connectionId":"c-1","token":"t"}"#).unwrap();
        assert!(body.user_data.is_none());
        let body: DeliverTokenBody = serde_json::from_str(
            r#"{"connectionId":"c-1","token":"t","userData":{"userId":"user-42","email":"","creditsRemaining":3,"subscriptionTier":"pro"}}"#,
        )
        .unwrap();
        assert_eq!(body.user_data.unwrap().subscription_tier, "pro");
    }
}
