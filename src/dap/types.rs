//! DAP message model
//!
//! Wire shapes for the three Debug Adapter Protocol message kinds plus the
//! typed payloads the handshake needs. Field names and casing follow the
//! protocol exactly so any adapter can read what we write.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Request command names used by the session core
pub mod commands {
    pub const INITIALIZE: &str = "initialize";
    pub const LAUNCH: &str = "launch";
    pub const CONFIGURATION_DONE: &str = "configurationDone";
    pub const DISCONNECT: &str = "disconnect";
}

/// Event names the session core reacts to
pub mod events {
    pub const INITIALIZED: &str = "initialized";
    pub const TERMINATED: &str = "terminated";
    pub const EXITED: &str = "exited";
}

// ============================================================================
// Messages
// ============================================================================

/// A single DAP protocol message, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

/// Client or adapter request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Sequence number, unique per sender for the session
    pub seq: i64,

    /// Command name
    pub command: String,

    /// Optional structured arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Response to a previously sent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Sender's own sequence number (adapters number their messages too)
    #[serde(default)]
    pub seq: i64,

    /// Sequence number of the request this answers
    pub request_seq: i64,

    /// Command of the request this answers
    pub command: String,

    /// Whether the request succeeded
    pub success: bool,

    /// Error message when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Optional structured result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Asynchronous notification from the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,

    /// Event name
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Message {
    /// Protocol `type` of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Event(_) => "event",
        }
    }

    /// Command or event name
    pub fn name(&self) -> &str {
        match self {
            Message::Request(request) => &request.command,
            Message::Response(response) => &response.command,
            Message::Event(event) => &event.event,
        }
    }

    /// Sequence number carried by the sender
    pub fn seq(&self) -> i64 {
        match self {
            Message::Request(request) => request.seq,
            Message::Response(response) => response.seq,
            Message::Event(event) => event.seq,
        }
    }
}

impl Response {
    /// Build the error response we send back for adapter requests we do not handle
    pub fn unsupported(request: &Request, seq: i64) -> Self {
        Self {
            seq,
            request_seq: request.seq,
            command: request.command.clone(),
            success: false,
            message: Some("reverse requests are not supported".to_string()),
            body: None,
        }
    }
}

// ============================================================================
// Handshake Payloads
// ============================================================================

/// Arguments of the `initialize` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestArguments {
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    #[serde(rename = "adapterID")]
    pub adapter_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,

    pub lines_start_at1: bool,

    pub columns_start_at1: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_format: Option<String>,
}

/// Subset of adapter capabilities reported by the `initialize` response.
///
/// Unknown fields are ignored; missing fields default to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub supports_configuration_done_request: Option<bool>,
    pub supports_function_breakpoints: Option<bool>,
    pub supports_conditional_breakpoints: Option<bool>,
    pub supports_evaluate_for_hovers: Option<bool>,
    pub supports_terminate_request: Option<bool>,
    pub support_terminate_debuggee: Option<bool>,
}

impl Capabilities {
    /// Parse capabilities from an `initialize` response body, tolerating
    /// absent or oddly shaped bodies
    pub fn from_body(body: Option<&Value>) -> Self {
        body.and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}
