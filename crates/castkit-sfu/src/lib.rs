//! # castkit-sfu
//!
//! Signaling relay for a selective forwarding unit:
//!
//! ```text
//!   Browser A ──ws──▶ handler ──▶ signaling ──▶ media engine
//!                                   │
//!                      registry ◀───┼───▶ directory ──fan-out──▶ other peers
//!                                   │          │
//!                                   │          └──changes──▶ egress bridge ──▶ transcoder ──▶ HLS
//! ```
//!
//! - [`registry`]: connected peers and the transports/producers/consumers they own
//! - [`directory`]: live producers, `new-producer` fan-out, change feed for egress
//! - [`signaling`]: the `{event, data, id}` request handlers
//! - [`handler`]: the axum WebSocket endpoint
//! - [`egress`]: the actor tying publisher count to the transcoder lifecycle

pub mod directory;
pub mod egress;
pub mod handler;
pub mod health;
pub mod outbound;
pub mod registry;
pub mod signaling;
pub mod state;

pub use egress::{EgressHandle, EgressState, EgressStatus, FfmpegTranscoder, Transcoder};
pub use handler::build_router;
pub use state::SfuState;
