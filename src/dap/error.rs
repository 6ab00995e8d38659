//! Error types for the DAP session core
//!
//! One error enum per layer. Lower layers convert into higher ones with
//! `#[from]` so callers always see which stage of the session failed.

use std::fmt;
use std::io;
use std::time::Duration;

use serde_json::Value;

use crate::config::ConfigError;
use crate::io::ProcessError;

// ============================================================================
// Transport Errors
// ============================================================================

/// Errors produced while framing or parsing messages
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Header block is malformed (missing or non-numeric Content-Length)
    #[error("Framing error: {0}")]
    Framing(String),

    /// Frame body is not a valid DAP message
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Stream closed before a complete frame was read
    #[error("End of stream")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// Errors surfaced to callers waiting on the dispatcher
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No response arrived within the deadline; the pending entry was dropped
    #[error("Timed out after {timeout:?} waiting for '{command}' response (seq {seq})")]
    Timeout {
        seq: i64,
        command: String,
        timeout: Duration,
    },

    /// The adapter stream closed or the session was stopped
    #[error("Debug adapter disconnected: {reason}")]
    AdapterDisconnected { reason: String },

    /// No outstanding request with this sequence number is awaitable
    #[error("No outstanding request with seq {0}")]
    UnknownRequest(i64),

    /// Writing the request frame failed
    #[error("Failed to send '{command}' request: {source}")]
    Write {
        command: String,
        #[source]
        source: TransportError,
    },
}

impl DispatchError {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::AdapterDisconnected {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Protocol Violations
// ============================================================================

/// Diagnostic record for messages that break the protocol contract.
///
/// Violations never abort the reader loop; they are logged and kept on the
/// dispatcher for later inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    /// Response whose `request_seq` matches no outstanding request
    UnknownResponse { request_seq: i64, command: String },

    /// Frame whose body could not be decoded
    MalformedMessage { reason: String },

    /// Message that arrived in a state that did not expect it
    UnexpectedMessage { state: String, message: String },

    /// Request sent by the adapter, which this client does not serve
    ReverseRequest { seq: i64, command: String },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownResponse {
                request_seq,
                command,
            } => write!(
                f,
                "response '{command}' for unknown request_seq {request_seq}"
            ),
            Self::MalformedMessage { reason } => write!(f, "malformed message: {reason}"),
            Self::UnexpectedMessage { state, message } => {
                write!(f, "unexpected {message} in state {state}")
            }
            Self::ReverseRequest { seq, command } => {
                write!(f, "unsupported reverse request '{command}' (seq {seq})")
            }
        }
    }
}

// ============================================================================
// Handshake Errors
// ============================================================================

/// Handshake step names used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Initialize,
    InitializedEvent,
    ConfigurationDone,
    Launch,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::InitializedEvent => "initialized event",
            Self::ConfigurationDone => "configurationDone",
            Self::Launch => "launch",
        };
        f.write_str(name)
    }
}

/// Handshake failures, always naming the step that failed
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The adapter answered a handshake request with `success: false`
    #[error("Handshake failed at {step}: {}", message.as_deref().unwrap_or("adapter gave no reason"))]
    Failed {
        step: HandshakeStep,
        message: Option<String>,
        body: Option<Value>,
    },

    /// A step did not complete within its deadline
    #[error("Handshake timeout: {step} stalled for {timeout:?}")]
    Timeout {
        step: HandshakeStep,
        timeout: Duration,
    },

    /// The adapter went away (stream closed, `terminated` or `exited`)
    #[error("Adapter disconnected during {step}: {reason}")]
    Disconnected { step: HandshakeStep, reason: String },

    #[error("Handshake already started")]
    AlreadyStarted,

    /// A request on the handshake path could not be sent
    #[error("Handshake {step} request could not be sent: {source}")]
    Dispatch {
        step: HandshakeStep,
        #[source]
        source: DispatchError,
    },
}

impl HandshakeError {
    /// Map a dispatcher error raised while running `step`
    pub fn from_dispatch(step: HandshakeStep, error: DispatchError) -> Self {
        match error {
            DispatchError::Timeout { timeout, .. } => Self::Timeout { step, timeout },
            DispatchError::AdapterDisconnected { reason } => Self::Disconnected { step, reason },
            other => Self::Dispatch {
                step,
                source: other,
            },
        }
    }

    /// Step the failure is attributed to, if any
    pub fn step(&self) -> Option<HandshakeStep> {
        match self {
            Self::Failed { step, .. }
            | Self::Timeout { step, .. }
            | Self::Disconnected { step, .. }
            | Self::Dispatch { step, .. } => Some(*step),
            Self::AlreadyStarted => None,
        }
    }

    /// Failure detail without the step prefix
    pub fn reason(&self) -> String {
        match self {
            Self::Failed { message, .. } => message
                .clone()
                .unwrap_or_else(|| "adapter gave no reason".to_string()),
            Self::Timeout { timeout, .. } => format!("timed out after {timeout:?}"),
            Self::Disconnected { reason, .. } => reason.clone(),
            Self::AlreadyStarted => self.to_string(),
            Self::Dispatch { source, .. } => source.to_string(),
        }
    }
}

// ============================================================================
// Session Errors
// ============================================================================

/// Errors returned by the consumer-facing session API
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter process error: {0}")]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
