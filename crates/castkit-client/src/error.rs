//! Error types for the castkit client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay answered a request with an `error` event.
    #[error("{code}: {message}")]
    Remote { code: String, message: String },

    /// No reply arrived before the request deadline.
    #[error("{event} timed out after {after_ms}ms")]
    Timeout { event: String, after_ms: u64 },

    /// The reply carried a different event than the request expects.
    #[error("Expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },

    /// The relay refused the WebSocket upgrade (409 for a peer id already in use).
    #[error("Connection rejected with HTTP {status}")]
    Rejected { status: u16 },

    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The signaling channel is closed.
    #[error("Signaling channel is closed")]
    Closed,
}

impl ClientError {
    /// Wire error code, when the relay sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
