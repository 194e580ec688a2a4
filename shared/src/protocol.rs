//! JSON control-channel protocol for Outpost.
//!
//! Every frame is a JSON object tagged by its `action` field, except the
//! broker's reply to `create_tunnel`, which carries a `status` instead.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Path the broker serves the control channel on.
pub const TUNNEL_PATH: &str = "/tunnel";

/// Tunnel protocol exposed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(Error::Config(format!("unsupported protocol '{}'", other))),
        }
    }
}

/// Messages exchanged on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client asks the broker to register a public endpoint
    CreateTunnel(CreateTunnel),
    /// Application-level liveness from the client
    Heartbeat(Heartbeat),
    /// Broker hands the client one unit of traffic to relay
    ForwardRequest(ForwardRequest),
    /// Client streams local output back for a request
    ForwardResponse(ForwardResponse),
    /// Client reports a failed request
    ErrorResponse(ErrorResponse),
    /// Broker tears the tunnel down
    TunnelClosed(TunnelClosed),
    /// Any action this client does not know about
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid control message: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of this message's action.
    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::CreateTunnel(_) => "create_tunnel",
            ControlMessage::Heartbeat(_) => "heartbeat",
            ControlMessage::ForwardRequest(_) => "forward_request",
            ControlMessage::ForwardResponse(_) => "forward_response",
            ControlMessage::ErrorResponse(_) => "error_response",
            ControlMessage::TunnelClosed(_) => "tunnel_closed",
            ControlMessage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnel {
    pub subdomain: String,
    pub local_host: String,
    pub local_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub tunnel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub request_id: String,
    /// Opaque payload for the local service
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub request_id: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Set on the last frame for this request
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClosed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Broker reply to `create_tunnel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Identity the broker assigned to a new tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAssignment {
    pub id: String,
    pub public_url: String,
}

impl CreateTunnelReply {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid create_tunnel reply: {}", e)))
    }

    /// Turn the reply into the assigned identity, or the broker's refusal.
    pub fn into_assignment(self) -> Result<TunnelAssignment> {
        match self.status {
            ReplyStatus::Ok => self
                .tunnel
                .ok_or_else(|| Error::Protocol("create_tunnel reply missing tunnel".to_string())),
            ReplyStatus::Error => Err(Error::Protocol(format!(
                "server error: {}",
                self.message.as_deref().unwrap_or("unknown error")
            ))),
        }
    }
}

/// Serde adapter carrying raw bytes as standard base64 strings.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
