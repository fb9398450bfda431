//! # castkit-client
//!
//! Async Rust client for the castkit signaling protocol.
//!
//! - [`client`]: the WebSocket channel and typed request helpers
//! - [`correlation`]: request id bookkeeping and reply routing
//! - [`session`]: channel state and the queue of producers announced too early

pub mod client;
pub mod correlation;
pub mod error;
pub mod session;

pub use client::{ClientEvent, SignalingClient};
pub use error::{ClientError, Result};
pub use session::ChannelState;
