//! Control-channel message framing.
//!
//! Every frame is a single JSON text message tagged by `type`. Binary
//! bodies are encoded as standard base64 strings on the wire and carried
//! as `Vec<u8>` once decoded.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// A base64-encoded byte string on the wire, plain bytes in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base64Body(pub Vec<u8>);

impl Serialize for Base64Body {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Body {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Base64Body(bytes))
    }
}

/// Multi-valued HTTP headers, preserved in wire order.
pub type Headers = Vec<(String, String)>;

/// Metadata carried on an inbound `REQUEST` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: Headers,
}

/// Metadata carried on an outbound `RESPONSE` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMetadata {
    pub status_code: u16,
    pub status_message: String,
    #[serde(default)]
    pub headers: Headers,
}

/// A single framed message on the control channel.
///
/// `timestamp` is the Unix-millisecond time the frame was produced,
/// stamped by the sender at serialization time (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Connect {
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_subdomain: Option<String>,
        agent_version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_count: Option<u64>,
    },
    ConnectAck {
        timestamp: u64,
        tunnel_id: String,
        subdomain: String,
        public_url: String,
    },
    Request {
        timestamp: u64,
        stream_id: String,
        tunnel_id: String,
        metadata: RequestMetadata,
        body: Base64Body,
    },
    Response {
        timestamp: u64,
        stream_id: String,
        metadata: ResponseMetadata,
        body: Base64Body,
    },
    Heartbeat {
        timestamp: u64,
    },
    HeartbeatAck {
        timestamp: u64,
    },
    LocalServicePing {
        timestamp: u64,
        tunnel_id: String,
        local_service_connected: bool,
    },
    RequestLog {
        timestamp: u64,
        tunnel_id: String,
        method: String,
        host: String,
        path: String,
        status_code: u16,
        response_time: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        ip_address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Error {
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        code: String,
        message: String,
    },
    Disconnect {
        timestamp: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Errors while encoding or decoding a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Unix-millisecond timestamp, used to stamp outgoing frames.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encode a frame as a single JSON text message.
///
/// Deserialization is tolerant of unknown fields (forward compatibility)
/// but rejects an absent or mismatched `type`; that tolerance comes for
/// free from `#[serde(tag = "type")]` since unrecognized object keys are
/// ignored by default.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a single JSON text message into a [`Frame`].
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(text)?)
}
