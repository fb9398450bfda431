//! The engine trait and the handle types it hands out.

use async_trait::async_trait;
use castkit_common::media::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters, TransportDirection,
};
use castkit_common::{CastResult, ConsumerId, MediaKind, ProducerId, TransportId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// What kind of transport to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Browser-facing ICE/DTLS transport.
    WebRtc(TransportDirection),
    /// Plain RTP towards a local process (egress rendezvous).
    Plain,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Overrides the engine's configured listen address.
    pub listen_ip: Option<String>,
    /// RTP and RTCP share one port. Plain transports usually want this off.
    pub rtcp_mux: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: None,
            rtcp_mux: true,
        }
    }
}

/// A transport as created by the engine.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub id: TransportId,
    pub kind: TransportKind,
    pub local_ip: String,
    pub local_port: u16,
    pub local_rtcp_port: Option<u16>,
    /// Present for WebRTC transports only.
    pub ice_parameters: Option<IceParameters>,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: Option<DtlsParameters>,
}

/// Remote side of a transport.
#[derive(Debug, Clone)]
pub enum ConnectParams {
    Dtls(DtlsParameters),
    Plain {
        ip: String,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Why the engine closed a consumer on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ProducerClosed,
    TransportClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProducerClosed => "producerclose",
            Self::TransportClosed => "transportclose",
        }
    }
}

/// Lifecycle notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TransportClosed {
        transport_id: TransportId,
    },
    ProducerClosed {
        producer_id: ProducerId,
        transport_id: TransportId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        reason: CloseReason,
    },
}

/// Narrow operation set castkit needs from a media engine.
///
/// Implementations normalize their failures into `CastError`:
/// `TransportNotFound` / `ProducerNotFound` / `ConsumerNotFound`,
/// `NotConnectable`, `AlreadyConnected`, `CapabilityMismatch`,
/// `PortRangeExhausted`, and `EngineClosed` once the engine is gone.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Router capabilities. Pure read.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        kind: TransportKind,
        options: TransportOptions,
    ) -> CastResult<TransportInfo>;

    /// Not idempotent: a second connect on the same transport fails.
    async fn connect_transport(&self, transport_id: &TransportId, params: ConnectParams) -> CastResult<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> CastResult<ProducerInfo>;

    /// Fails with `CapabilityMismatch` (and creates nothing) when the
    /// capabilities cannot receive any of the producer's codecs.
    async fn consume(&self, transport_id: &TransportId, options: ConsumeOptions) -> CastResult<ConsumerInfo>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> CastResult<()>;

    /// Closes the producer and every consumer fed by it.
    async fn close_producer(&self, producer_id: &ProducerId) -> CastResult<()>;

    /// Closes the transport, its producers (and their consumers) and its consumers.
    async fn close_transport(&self, transport_id: &TransportId) -> CastResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// `true` while the engine is usable. Flips to `false` exactly once.
    fn liveness(&self) -> watch::Receiver<bool>;
}

pub type SharedEngine = Arc<dyn MediaEngine>;
