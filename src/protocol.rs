use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

/// Composite key identifying one inbound request. Replay protection, the
/// dispatch table, and terminal-frame accounting are all keyed by this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub session_id: String,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(session_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    AdapterCrash,
    AgentBusy,
    AuthFailed,
    AgentOffline,
    InvalidMessage,
    SessionNotFound,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::AdapterCrash => "adapter_crash",
            ErrorCode::AgentBusy => "agent_busy",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::AgentOffline => "agent_offline",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Metadata advertised to a caller when a completed request produced a file
/// payload. The bytes themselves never cross the relay; they are picked up
/// peer-to-peer using the `transfer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub transfer_id: String,
    pub size: u64,
    pub sha256: String,
    pub file_count: u32,
}

/// Frames the relay delivers to the bridge over the persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayInbound {
    Message {
        session_id: String,
        request_id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        with_files: bool,
    },
    Cancel {
        session_id: String,
        request_id: String,
    },
    RtcSignalRelay {
        transfer_id: String,
        from_agent_id: String,
        signal_type: String,
        payload: Value,
    },
}

/// Frames the bridge sends back to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayOutbound {
    Chunk {
        session_id: String,
        request_id: String,
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
    },
    Done {
        session_id: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Attachment>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_transfer_offer: Option<TransferOffer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        session_id: String,
        request_id: String,
        code: ErrorCode,
        message: String,
    },
    RtcSignal {
        transfer_id: String,
        target_agent_id: String,
        signal_type: String,
        payload: Value,
    },
}
