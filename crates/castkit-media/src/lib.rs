//! # castkit-media
//!
//! The media engine boundary. Everything that actually touches RTP (ICE/DTLS
//! handshakes, packetization, codecs) lives behind [`MediaEngine`]; the rest of
//! castkit only creates, connects, produces, consumes, resumes and closes.
//!
//! [`LocalEngine`] is an in-process simulation of the full contract:
//! engine-assigned ids, RTC port allocation, ICE/DTLS parameters, codec
//! matching, paused consumers and transitive close with lifecycle events.
//! It forwards no packets.

pub mod engine;
pub mod local;

pub use engine::{
    CloseReason, ConnectParams, ConsumeOptions, ConsumerInfo, EngineEvent, MediaEngine, ProducerInfo,
    SharedEngine, TransportInfo, TransportKind, TransportOptions,
};
pub use local::LocalEngine;
