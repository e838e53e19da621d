//! Control frame types for the rutunnel handshake protocol

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide correlation id sequence
static ID_SEQ: AtomicI64 = AtomicI64::new(0);

/// Allocate the next correlation id.
///
/// Ids are unique within the process and monotonically increasing. They only
/// need to be unique among live sessions, not globally.
pub fn next_id() -> i64 {
    ID_SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

/// Handshake method carried in a control frame.
///
/// Serialized as a bare integer; the codes are part of the wire format and
/// must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Method {
    /// Agent registers itself into the server pool
    RegisterAgent,

    /// Server instructs a pooled agent to dial a target
    AgentDialRequest,

    /// Agent failed to reach the target
    AgentDialError,

    /// Agent reached the target, channel switches to raw data
    AgentDialSuccess,

    /// Remote client asks the server to dial on its behalf
    ClientDialRequest,

    /// Server could not complete the client dialout
    ClientDialError,

    /// Client dialout succeeded, channel switches to raw data
    ClientDialSuccess,
}

impl From<Method> for i64 {
    fn from(method: Method) -> i64 {
        match method {
            Method::RegisterAgent => 0,
            Method::AgentDialRequest => 1,
            Method::AgentDialError => 2,
            Method::AgentDialSuccess => 3,
            Method::ClientDialRequest => 4,
            Method::ClientDialError => 5,
            Method::ClientDialSuccess => 6,
        }
    }
}

impl TryFrom<i64> for Method {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Method::RegisterAgent),
            1 => Ok(Method::AgentDialRequest),
            2 => Ok(Method::AgentDialError),
            3 => Ok(Method::AgentDialSuccess),
            4 => Ok(Method::ClientDialRequest),
            5 => Ok(Method::ClientDialError),
            6 => Ok(Method::ClientDialSuccess),
            other => Err(format!("unknown method code: {}", other)),
        }
    }
}

/// A single control frame.
///
/// Exactly one frame is exchanged per handshake step; after a successful
/// handshake the channel carries only opaque binary data frames. Field keys
/// are shortened on the wire to keep frames compact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPacket {
    /// Correlation id, see [`next_id`]
    #[serde(rename = "i")]
    pub id: i64,

    /// Handshake method
    #[serde(rename = "m")]
    pub method: Method,

    /// Target network, present on dial requests ("tcp")
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Target address, present on dial requests ("host:port")
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Error text, present on error methods
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlPacket {
    fn bare(id: i64, method: Method) -> Self {
        ControlPacket {
            id,
            method,
            network: None,
            address: None,
            error: None,
        }
    }

    /// Create an agent registration frame
    pub fn register(id: i64) -> Self {
        Self::bare(id, Method::RegisterAgent)
    }

    /// Create a dial instruction for a pooled agent
    pub fn dial_request(id: i64, network: &str, address: &str) -> Self {
        ControlPacket {
            network: Some(network.to_string()),
            address: Some(address.to_string()),
            ..Self::bare(id, Method::AgentDialRequest)
        }
    }

    /// Create an agent-side dial failure frame
    pub fn dial_error(id: i64, error: String) -> Self {
        ControlPacket {
            error: Some(error),
            ..Self::bare(id, Method::AgentDialError)
        }
    }

    /// Create an agent-side dial success frame
    pub fn dial_success(id: i64) -> Self {
        Self::bare(id, Method::AgentDialSuccess)
    }

    /// Create a client dialout request frame
    pub fn client_dial_request(id: i64, network: &str, address: &str) -> Self {
        ControlPacket {
            network: Some(network.to_string()),
            address: Some(address.to_string()),
            ..Self::bare(id, Method::ClientDialRequest)
        }
    }

    /// Create a client dialout failure frame
    pub fn client_dial_error(id: i64, error: String) -> Self {
        ControlPacket {
            error: Some(error),
            ..Self::bare(id, Method::ClientDialError)
        }
    }

    /// Create a client dialout success frame
    pub fn client_dial_success(id: i64) -> Self {
        Self::bare(id, Method::ClientDialSuccess)
    }

    /// Serialize to the text frame payload
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a received frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
