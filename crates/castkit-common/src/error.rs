//! Centralized error types for castkit.
//!
//! Uses `thiserror` for ergonomic error definitions. Every variant maps to a
//! stable `error_code()` string that is sent to peers inside `error` events.

use crate::ids::{ConsumerId, PeerId, ProducerId, TransportId};

/// Core error type used across the engine adapter, signaling layer and egress bridge.
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    // === Protocol errors ===
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("Peer {0} is already connected")]
    DuplicatePeer(PeerId),

    #[error("Transport {0} not found")]
    TransportNotFound(TransportId),

    #[error("Producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("Consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("Cannot consume own producer {0}")]
    CannotConsumeOwnProducer(ProducerId),

    // === Engine errors ===
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("Transport {transport_id} is not connectable: {reason}")]
    NotConnectable {
        transport_id: TransportId,
        reason: String,
    },

    #[error("Transport {0} is already connected")]
    AlreadyConnected(TransportId),

    // === Resource exhaustion ===
    #[error("RTC port range {min}-{max} exhausted")]
    PortRangeExhausted { min: u16, max: u16 },

    // === Fatal ===
    #[error("Media engine is closed")]
    EngineClosed,

    // === Egress ===
    #[error("Transcoder error: {0}")]
    Transcoder(String),

    // === Infrastructure errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CastError {
    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
            Self::PeerNotFound(_) => "PEER_NOT_FOUND",
            Self::DuplicatePeer(_) => "DUPLICATE_PEER",
            Self::TransportNotFound(_) => "TRANSPORT_NOT_FOUND",
            Self::ProducerNotFound(_) => "PRODUCER_NOT_FOUND",
            Self::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            Self::CannotConsumeOwnProducer(_) => "CANNOT_CONSUME_OWN_PRODUCER",
            Self::CapabilityMismatch(_) => "CAPABILITY_MISMATCH",
            Self::NotConnectable { .. } => "NOT_CONNECTABLE",
            Self::AlreadyConnected(_) => "ALREADY_CONNECTED",
            Self::PortRangeExhausted { .. } => "PORT_RANGE_EXHAUSTED",
            Self::EngineClosed => "ENGINE_CLOSED",
            Self::Transcoder(_) => "TRANSCODER_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The process cannot keep running once the engine is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineClosed)
    }

    /// Message safe to send to a peer. Infrastructure details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Io(e) => {
                tracing::error!("IO error: {e}");
                "An internal error occurred".to_string()
            }
            Self::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for CastError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

/// Convenience type alias for Results using CastError.
pub type CastResult<T> = Result<T, CastError>;
