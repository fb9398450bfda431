//! In-process simulated media engine.
//!
//! Keeps the full object graph (transports → producers/consumers) and enforces
//! the engine contract, so the signaling layer and egress bridge run against
//! real engine semantics without an external worker process.
//!
//! It never opens a socket. Ports are only reserved, ICE candidates point
//! at addresses nobody listens on, and the DTLS fingerprint belongs to no
//! certificate. Browsers finish signaling against it but no media flows.

mod credentials;
mod ports;

use crate::engine::{
    CloseReason, ConnectParams, ConsumeOptions, ConsumerInfo, EngineEvent, MediaEngine, ProducerInfo,
    TransportInfo, TransportKind, TransportOptions,
};
use async_trait::async_trait;
use castkit_common::config::MediaConfig;
use castkit_common::media::{
    DtlsFingerprint, IceCandidate, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    RtcpFeedback,
};
use castkit_common::{CastError, CastResult, ConsumerId, MediaKind, ProducerId, TransportId};
use ports::PortPool;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, watch, Mutex};

/// A simulated engine that lives inside the relay process.
#[derive(Debug)]
pub struct LocalEngine {
    state: Mutex<EngineState>,
    capabilities: RtpCapabilities,
    listen_ip: String,
    announced_ip: Option<String>,
    fingerprint: DtlsFingerprint,
    events: broadcast::Sender<EngineEvent>,
    alive: watch::Sender<bool>,
}

#[derive(Debug)]
struct EngineState {
    ports: PortPool,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

#[derive(Debug)]
struct TransportEntry {
    kind: TransportKind,
    ports: Vec<u16>,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

#[derive(Debug)]
struct ProducerEntry {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

/// Object counts, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub ports_in_use: usize,
}

impl LocalEngine {
    pub fn new(config: &MediaConfig) -> CastResult<Self> {
        if config.rtc_min_port > config.rtc_max_port {
            return Err(CastError::Internal(anyhow::anyhow!(
                "invalid RTC port range {}-{}",
                config.rtc_min_port,
                config.rtc_max_port
            )));
        }
        let (events, _) = broadcast::channel(1024);
        let (alive, _) = watch::channel(true);

        tracing::info!(
            listen_ip = %config.listen_ip,
            min_port = config.rtc_min_port,
            max_port = config.rtc_max_port,
            "Local media engine started"
        );

        Ok(Self {
            state: Mutex::new(EngineState {
                ports: PortPool::new(config.rtc_min_port, config.rtc_max_port),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            }),
            capabilities: RtpCapabilities {
                codecs: default_media_codecs(),
                header_extensions: Vec::new(),
            },
            listen_ip: config.listen_ip.clone(),
            announced_ip: config.announced_ip.clone(),
            fingerprint: credentials::certificate_fingerprint(),
            events,
            alive,
        })
    }

    /// Simulates death of the engine. Every later operation fails with `EngineClosed`.
    pub fn shutdown(&self) {
        self.alive.send_replace(false);
        tracing::error!("Local media engine shut down");
    }

    pub async fn counts(&self) -> EngineCounts {
        let state = self.state.lock().await;
        EngineCounts {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            ports_in_use: state.ports.in_use(),
        }
    }

    /// `None` if the consumer does not exist.
    pub async fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().await.consumers.get(consumer_id).map(|c| c.paused)
    }

    fn ensure_alive(&self) -> CastResult<()> {
        if *self.alive.borrow() {
            Ok(())
        } else {
            Err(CastError::EngineClosed)
        }
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

impl EngineState {
    fn allocate_ports(&mut self, count: usize) -> CastResult<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            match self.ports.allocate() {
                Some(port) => ports.push(port),
                None => {
                    for port in ports {
                        self.ports.release(port);
                    }
                    let (min, max) = self.ports.range();
                    return Err(CastError::PortRangeExhausted { min, max });
                }
            }
        }
        Ok(ports)
    }

    fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        let consumer = self.consumers.remove(consumer_id)?;
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        Some(consumer)
    }

    fn remove_producer(&mut self, producer_id: &ProducerId, events: &mut Vec<EngineEvent>) -> bool {
        let Some(producer) = self.producers.remove(producer_id) else {
            return false;
        };
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
        for consumer_id in producer.consumers {
            if self.remove_consumer(&consumer_id).is_some() {
                events.push(EngineEvent::ConsumerClosed {
                    consumer_id,
                    producer_id: producer_id.clone(),
                    reason: CloseReason::ProducerClosed,
                });
            }
        }
        events.push(EngineEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            transport_id: producer.transport_id,
        });
        true
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        kind: TransportKind,
        options: TransportOptions,
    ) -> CastResult<TransportInfo> {
        self.ensure_alive()?;
        let port_count = if options.rtcp_mux { 1 } else { 2 };
        let local_ip = options.listen_ip.unwrap_or_else(|| self.listen_ip.clone());

        let mut state = self.state.lock().await;
        let ports = state.allocate_ports(port_count)?;
        let id = TransportId::new(uuid::Uuid::new_v4().to_string());

        let (ice_parameters, ice_candidates, dtls_parameters) = match kind {
            TransportKind::WebRtc(_) => {
                let candidate = IceCandidate {
                    foundation: "udpcandidate".into(),
                    priority: 1_076_302_079,
                    ip: self.announced_ip.clone().unwrap_or_else(|| local_ip.clone()),
                    protocol: "udp".into(),
                    port: ports[0],
                    candidate_type: "host".into(),
                };
                (
                    Some(credentials::ice_parameters()),
                    vec![candidate],
                    Some(credentials::dtls_parameters(&self.fingerprint)),
                )
            }
            TransportKind::Plain => (None, Vec::new(), None),
        };

        state.transports.insert(
            id.clone(),
            TransportEntry {
                kind,
                ports: ports.clone(),
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );

        tracing::debug!(transport = %id, ?kind, port = ports[0], "Transport created");

        Ok(TransportInfo {
            id,
            kind,
            local_ip,
            local_port: ports[0],
            local_rtcp_port: ports.get(1).copied(),
            ice_parameters,
            ice_candidates,
            dtls_parameters,
        })
    }

    async fn connect_transport(&self, transport_id: &TransportId, params: ConnectParams) -> CastResult<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| CastError::TransportNotFound(transport_id.clone()))?;

        if transport.connected {
            return Err(CastError::AlreadyConnected(transport_id.clone()));
        }

        match (&transport.kind, &params) {
            (TransportKind::WebRtc(_), ConnectParams::Dtls(dtls)) => {
                if dtls.fingerprints.is_empty() {
                    return Err(CastError::NotConnectable {
                        transport_id: transport_id.clone(),
                        reason: "no DTLS fingerprints".into(),
                    });
                }
            }
            (TransportKind::Plain, ConnectParams::Plain { ip, .. }) => {
                if ip.parse::<std::net::IpAddr>().is_err() {
                    return Err(CastError::NotConnectable {
                        transport_id: transport_id.clone(),
                        reason: format!("invalid remote ip {ip}"),
                    });
                }
            }
            _ => {
                return Err(CastError::NotConnectable {
                    transport_id: transport_id.clone(),
                    reason: "connect parameters do not match transport kind".into(),
                });
            }
        }

        transport.connected = true;
        tracing::debug!(transport = %transport_id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        _app_data: Value,
    ) -> CastResult<ProducerInfo> {
        self.ensure_alive()?;

        let media_codecs: Vec<&RtpCodecParameters> =
            rtp_parameters.codecs.iter().filter(|c| !c.is_rtx()).collect();
        if media_codecs.is_empty() {
            return Err(CastError::CapabilityMismatch(format!("no {kind} codec in rtpParameters")));
        }
        if let Some(unsupported) = media_codecs
            .iter()
            .find(|c| self.capabilities.find_codec(kind, c).is_none())
        {
            return Err(CastError::CapabilityMismatch(format!(
                "router does not support {}",
                unsupported.mime_type
            )));
        }

        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| CastError::TransportNotFound(transport_id.clone()))?;

        let id = ProducerId::new(uuid::Uuid::new_v4().to_string());
        transport.producers.insert(id.clone());
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
                consumers: HashSet::new(),
            },
        );

        tracing::debug!(producer = %id, transport = %transport_id, %kind, "Producer created");

        Ok(ProducerInfo {
            id,
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn consume(&self, transport_id: &TransportId, options: ConsumeOptions) -> CastResult<ConsumerInfo> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;

        if !state.transports.contains_key(transport_id) {
            return Err(CastError::TransportNotFound(transport_id.clone()));
        }
        let producer = state
            .producers
            .get(&options.producer_id)
            .ok_or_else(|| CastError::ProducerNotFound(options.producer_id.clone()))?;

        let kind = producer.kind;
        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .filter_map(|codec| {
                options.rtp_capabilities.find_codec(kind, codec).map(|cap| RtpCodecParameters {
                    payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                    rtcp_feedback: cap.rtcp_feedback.clone(),
                    ..codec.clone()
                })
            })
            .collect();

        if codecs.is_empty() {
            return Err(CastError::CapabilityMismatch(format!(
                "cannot consume producer {}",
                options.producer_id
            )));
        }

        let rtp_parameters = RtpParameters {
            mid: None,
            codecs,
            header_extensions: Vec::new(),
            encodings: producer.rtp_parameters.encodings.clone(),
            rtcp: None,
        };

        let id = ConsumerId::new(uuid::Uuid::new_v4().to_string());
        if let Some(producer) = state.producers.get_mut(&options.producer_id) {
            producer.consumers.insert(id.clone());
        }
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.consumers.insert(id.clone());
        }
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: transport_id.clone(),
                producer_id: options.producer_id.clone(),
                paused: options.paused,
            },
        );

        tracing::debug!(
            consumer = %id,
            producer = %options.producer_id,
            paused = options.paused,
            "Consumer created"
        );

        Ok(ConsumerInfo {
            id,
            transport_id: transport_id.clone(),
            producer_id: options.producer_id,
            kind,
            rtp_parameters,
            paused: options.paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> CastResult<()> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| CastError::ConsumerNotFound(consumer_id.clone()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> CastResult<()> {
        self.ensure_alive()?;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if !state.remove_producer(producer_id, &mut events) {
                return Err(CastError::ProducerNotFound(producer_id.clone()));
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> CastResult<()> {
        self.ensure_alive()?;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            let transport = state
                .transports
                .remove(transport_id)
                .ok_or_else(|| CastError::TransportNotFound(transport_id.clone()))?;

            for port in &transport.ports {
                state.ports.release(*port);
            }
            for producer_id in &transport.producers {
                state.remove_producer(producer_id, &mut events);
            }
            for consumer_id in transport.consumers {
                if let Some(consumer) = state.remove_consumer(&consumer_id) {
                    events.push(EngineEvent::ConsumerClosed {
                        consumer_id,
                        producer_id: consumer.producer_id,
                        reason: CloseReason::TransportClosed,
                    });
                }
            }
            events.push(EngineEvent::TransportClosed {
                transport_id: transport_id.clone(),
            });
        }
        tracing::debug!(transport = %transport_id, "Transport closed");
        self.emit(events);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }
}

/// Router codecs: Opus, VP8 and baseline H264.
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = vec![
        RtcpFeedback { kind: "nack".into(), parameter: String::new() },
        RtcpFeedback { kind: "nack".into(), parameter: "pli".into() },
        RtcpFeedback { kind: "ccm".into(), parameter: "fir".into() },
        RtcpFeedback { kind: "goog-remb".into(), parameter: String::new() },
    ];

    let mut h264_params = Map::new();
    h264_params.insert("packetization-mode".into(), Value::from(1));
    h264_params.insert("profile-level-id".into(), Value::from("42e01f"));
    h264_params.insert("level-asymmetry-allowed".into(), Value::from(1));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: Some(100),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: Some(101),
            clock_rate: 90_000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: video_feedback.clone(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            preferred_payload_type: Some(102),
            clock_rate: 90_000,
            channels: None,
            parameters: h264_params,
            rtcp_feedback: video_feedback,
        },
    ]
}
