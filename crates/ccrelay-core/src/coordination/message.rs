//! Wire envelope for the Leader/Follower coordination channel (spec §4.8).
//! Frames are length-delimited UTF-8 JSON objects; actix-ws/tokio-tungstenite
//! already frame at the WebSocket layer, so this module only owns the JSON
//! payload shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageType {
    /// L -> F, sent exactly once on accept.
    Connected {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
    /// L -> F, fire-and-forget after a successful switch.
    ProviderChanged {
        #[serde(rename = "providerId")]
        provider_id: String,
        #[serde(rename = "providerName")]
        provider_name: String,
    },
    /// L -> F, best-effort; followers must not reconnect after this.
    ServerStopping,
    /// F -> L, keepalive, cadence 30s.
    Ping,
    /// L -> F, reply to `Ping`.
    Pong,
    /// F -> L, request the leader switch providers. Idempotent on the
    /// already-current id.
    SwitchProvider {
        #[serde(rename = "providerId")]
        provider_id: String,
    },
    /// L -> F, correlated reply to `SwitchProvider`.
    SwitchResult {
        success: bool,
        #[serde(rename = "providerId")]
        provider_id: Option<String>,
        #[serde(rename = "providerName")]
        provider_name: Option<String>,
        error: Option<String>,
    },
}

/// The envelope every frame carries: `{type, payload?, timestamp}`. Serde's
/// adjacently-tagged representation on [`MessageType`] folds `type` and
/// `payload` into this struct's own fields when flattened, so encode/decode
/// happens through `Envelope` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: MessageType,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: MessageType) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let env = Envelope::new(MessageType::ProviderChanged {
            provider_id: "openai".to_string(),
            provider_name: "OpenAI".to_string(),
        });
        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        match decoded.message {
            MessageType::ProviderChanged {
                provider_id,
                provider_name,
            } => {
                assert_eq!(provider_id, "openai");
                assert_eq!(provider_name, "OpenAI");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unit_variants_encode_without_payload_field_populated() {
        let env = Envelope::new(MessageType::ServerStopping);
        let encoded = env.encode().unwrap();
        assert!(encoded.contains("\"server_stopping\""));
    }
}
