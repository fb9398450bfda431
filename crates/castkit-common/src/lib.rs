//! # castkit-common
//!
//! Shared types, wire protocol, configuration, and error handling used across all castkit crates.
//! This is the foundation layer: no orchestration logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod ids;
pub mod media;
pub mod protocol;

pub use error::{CastError, CastResult};
pub use ids::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};
