//! Defines the JSON frame protocol spoken with the gateway.
//!
//! Every frame is a single JSON object tagged by `type`. Outbound requests
//! carry a correlation id plus a method-tagged parameter block; inbound
//! responses echo the id; inbound events are name-tagged pushes. Event names
//! this client does not know are deserialized as [`GatewayEvent::Unknown`]
//! and ignored, so new server events never break an old client.

use sage_core::history::HistoryEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lowest protocol revision this client can speak.
pub const PROTOCOL_VERSION_MIN: u32 = 1;
/// Highest protocol revision this client can speak.
pub const PROTOCOL_VERSION_MAX: u32 = 1;

/// A single frame on the wire, in either direction.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// An outbound request awaiting a correlated response.
    Req {
        id: String,
        #[serde(flatten)]
        call: RequestCall,
    },
    /// A response to a previously issued request.
    Res {
        id: String,
        ok: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// A server-pushed event.
    Event {
        #[serde(flatten)]
        event: GatewayEvent,
    },
}

/// Error detail carried by a failed response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub message: String,
}

/// The methods this client issues, with their typed parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "method", content = "params")]
pub enum RequestCall {
    #[serde(rename = "connect")]
    Connect(ConnectParams),
    #[serde(rename = "chat.send")]
    ChatSend(ChatSendParams),
    #[serde(rename = "chat.history")]
    ChatHistory(ChatHistoryParams),
    #[serde(rename = "chat.abort")]
    ChatAbort(ChatAbortParams),
}

/// Events pushed by the gateway.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "payload")]
pub enum GatewayEvent {
    #[serde(rename = "connect.challenge")]
    Challenge(ChallengePayload),
    #[serde(rename = "chat")]
    Chat(ChatEventPayload),
    /// Any event name this client does not recognize.
    #[serde(other)]
    Unknown,
}

// --- Handshake ---

/// Parameters of the `connect` handshake request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol_version: u32,
    pub max_protocol_version: u32,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub auth: AuthBlock,
    pub device: DeviceBlock,
    pub locale: String,
    pub user_agent: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
}

/// Authentication material. A gateway-issued device token supersedes the
/// bearer credential; at most one of the two is sent.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// Device identity block. The nonce is the challenge value echoed back
/// verbatim; it is not a cryptographic signature.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceBlock {
    pub id: String,
    pub nonce: String,
}

/// Payload of the `connect.challenge` event.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChallengePayload {
    pub nonce: String,
}

/// Payload of a successful handshake acknowledgement.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub device_token: Option<String>,
}

/// The `type` marker a successful handshake acknowledgement must carry.
pub const HELLO_OK: &str = "hello-ok";

// --- Chat ---

/// Parameters of a `chat.send` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub message: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// An attachment on an outbound chat message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
}

/// Acknowledgement payload for `chat.send`; may carry the server-assigned
/// run id.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatAckPayload {
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Parameters of a `chat.history` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatHistoryParams {
    pub limit: u32,
}

/// Payload of a `chat.history` response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryPayload {
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
}

/// Parameters of a `chat.abort` request.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Payload of a streamed `chat` event. A `delta` appends to the run buffer;
/// `content` (or a nested `message.content`) replaces it wholesale; a
/// terminal `status` completes the run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message: Option<ChatMessageBody>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessageBody {
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let frame = Frame::Req {
            id: "7".into(),
            call: RequestCall::ChatSend(ChatSendParams {
                message: "hello".into(),
                idempotency_key: "key-1".into(),
                attachments: vec![],
            }),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "req",
                "id": "7",
                "method": "chat.send",
                "params": { "message": "hello", "idempotencyKey": "key-1" }
            })
        );
    }

    #[test]
    fn test_attachments_serialize_when_present() {
        let params = ChatSendParams {
            message: "look at this".into(),
            idempotency_key: "key-2".into(),
            attachments: vec![Attachment {
                kind: "image".into(),
                data: "aGk=".into(),
            }],
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["attachments"][0]["type"], "image");
        assert_eq!(value["attachments"][0]["data"], "aGk=");
    }

    #[test]
    fn test_response_frame_with_error() {
        let text = r#"{"type":"res","id":"3","ok":false,"payload":null,"error":{"message":"no such method"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        match frame {
            Frame::Res {
                id, ok, error: Some(error), ..
            } => {
                assert_eq!(id, "3");
                assert!(!ok);
                assert_eq!(error.message, "no such method");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_challenge_event_parses() {
        let text = r#"{"type":"event","event":"connect.challenge","payload":{"nonce":"abc123"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        match frame {
            Frame::Event {
                event: GatewayEvent::Challenge(challenge),
            } => assert_eq!(challenge.nonce, "abc123"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_chat_event_parses_all_content_forms() {
        let delta: Frame = serde_json::from_str(
            r#"{"type":"event","event":"chat","payload":{"delta":"Hi","runId":"r-1"}}"#,
        )
        .unwrap();
        match delta {
            Frame::Event {
                event: GatewayEvent::Chat(payload),
            } => {
                assert_eq!(payload.delta.as_deref(), Some("Hi"));
                assert_eq!(payload.run_id.as_deref(), Some("r-1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let nested: Frame = serde_json::from_str(
            r#"{"type":"event","event":"chat","payload":{"message":{"content":"whole"},"status":"done"}}"#,
        )
        .unwrap();
        match nested {
            Frame::Event {
                event: GatewayEvent::Chat(payload),
            } => {
                assert_eq!(
                    payload.message.and_then(|m| m.content).as_deref(),
                    Some("whole")
                );
                assert_eq!(payload.status.as_deref(), Some("done"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_event_becomes_unknown() {
        let text = r#"{"type":"event","event":"presence.update","payload":{"who":"someone"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        assert!(matches!(
            frame,
            Frame::Event {
                event: GatewayEvent::Unknown
            }
        ));
    }

    #[test]
    fn test_connect_params_use_camel_case() {
        let params = ConnectParams {
            min_protocol_version: PROTOCOL_VERSION_MIN,
            max_protocol_version: PROTOCOL_VERSION_MAX,
            client: ClientInfo {
                name: "sage".into(),
                version: "0.1.0".into(),
                platform: "linux".into(),
            },
            role: "assistant".into(),
            scopes: vec!["chat".into()],
            auth: AuthBlock {
                device_token: Some("dt-1".into()),
                bearer_token: None,
            },
            device: DeviceBlock {
                id: "device-1".into(),
                nonce: "n-1".into(),
            },
            locale: "en-US".into(),
            user_agent: "sage/0.1.0".into(),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocolVersion"], 1);
        assert_eq!(value["userAgent"], "sage/0.1.0");
        assert_eq!(value["auth"]["deviceToken"], "dt-1");
        // The unused credential is omitted, not null.
        assert!(value["auth"].get("bearerToken").is_none());
        assert_eq!(value["device"]["nonce"], "n-1");
    }

    #[test]
    fn test_hello_payload_parses() {
        let hello: HelloPayload = serde_json::from_value(json!({
            "type": "hello-ok",
            "protocolVersion": 1,
            "deviceToken": "dt-99"
        }))
        .unwrap();
        assert_eq!(hello.kind, HELLO_OK);
        assert_eq!(hello.protocol_version, Some(1));
        assert_eq!(hello.device_token.as_deref(), Some("dt-99"));
    }
}
