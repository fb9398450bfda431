//! Signaling dispatcher: one handler per request event.
//!
//! Every inbound frame is answered with exactly one envelope: the event's
//! reply on success or an `error` event otherwise, both tagged with the
//! request `id`.

use crate::outbound::{self, Outbound, OutboundReceiver};
use crate::registry::{ConsumerRecord, ProducerRecord, RemovedPeer, TransportRecord};
use crate::state::SfuState;
use castkit_common::protocol::{
    events, CloseProducerRequest, ConnectWebRtcTransportRequest, ConsumeRequest, Consumed, ConsumerClosed,
    ConsumerResumed, CreateWebRtcTransportRequest, Envelope, ProduceRequest, Produced,
    ProducerClosed, ResumeConsumerRequest, WebRtcTransportCreated,
};
use castkit_common::{CastError, CastResult, PeerId};
use castkit_media::{ConnectParams, ConsumeOptions, EngineEvent, TransportKind, TransportOptions};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Registers the peer and queues one `new-producer` per producer it does not own.
///
/// Registration and backfill happen under the same locks as produce's
/// fan-out, so every existing producer is announced exactly once.
///
/// Nothing drains the queue until the handler starts its writer, so the
/// queue holds the whole backfill on top of the configured capacity.
pub async fn connect(state: &SfuState, peer_id: PeerId) -> CastResult<(Outbound, OutboundReceiver)> {
    let mut registry = state.registry.write().await;
    if registry.contains(&peer_id) {
        return Err(CastError::DuplicatePeer(peer_id));
    }
    let directory = state.directory.read().await;

    let backfill = directory.list_except(&peer_id);
    let count = backfill.len();
    let (tx, rx) = outbound::channel(peer_id.clone(), state.config.outbound_queue_capacity + count);
    registry.register(peer_id.clone(), tx.clone())?;

    for producer in backfill {
        match Envelope::event(events::NEW_PRODUCER, producer) {
            Ok(envelope) => {
                tx.try_push(envelope);
            }
            Err(e) => tracing::error!(peer = %peer_id, error = %e, "Failed to encode new-producer"),
        }
    }

    tracing::info!(peer = %peer_id, backfill = count, peers = registry.len(), "Peer connected");
    Ok((tx, rx))
}

/// Reconciles registry and directory, then closes the peer's transports in
/// the engine. Returns `None` if the peer was already gone.
pub async fn disconnect(state: &SfuState, peer_id: &PeerId) -> Option<RemovedPeer> {
    let (removed, directory_removed) = {
        let mut registry = state.registry.write().await;
        let removed = registry.unregister(peer_id)?;
        let mut directory = state.directory.write().await;
        let count = removed
            .producer_ids
            .iter()
            .filter(|id| directory.remove(id).is_some())
            .count();
        (removed, count)
    };

    for transport_id in &removed.transport_ids {
        if let Err(e) = state.engine.close_transport(transport_id).await {
            tracing::debug!(peer = %peer_id, transport = %transport_id, error = %e, "Transport close failed");
        }
    }

    tracing::info!(
        peer = %peer_id,
        transports = removed.transport_ids.len(),
        producers = directory_removed,
        session_secs = (Utc::now() - removed.connected_at).num_seconds(),
        "Peer disconnected"
    );
    Some(removed)
}

/// Parses and dispatches one text frame.
pub async fn handle_text(state: &SfuState, peer_id: &PeerId, text: &str) -> Envelope {
    match Envelope::parse(text) {
        Ok(envelope) => dispatch(state, peer_id, envelope).await,
        Err((id, e)) => {
            tracing::debug!(peer = %peer_id, error = %e, "Rejected malformed frame");
            Envelope::error(id, &e)
        }
    }
}

pub async fn dispatch(state: &SfuState, peer_id: &PeerId, request: Envelope) -> Envelope {
    let id = request.id.clone();
    let event = request.event.clone();

    let result = match event.as_str() {
        events::GET_ROUTER_RTP_CAPABILITIES => get_router_rtp_capabilities(state, peer_id, &request).await,
        events::CREATE_WEBRTC_TRANSPORT => create_webrtc_transport(state, peer_id, &request).await,
        events::CONNECT_WEBRTC_TRANSPORT => connect_webrtc_transport(state, peer_id, &request).await,
        events::PRODUCE => produce(state, peer_id, &request).await,
        events::CONSUME => consume(state, peer_id, &request).await,
        events::RESUME_CONSUMER => resume_consumer(state, peer_id, &request).await,
        events::CLOSE_PRODUCER => close_producer(state, peer_id, &request).await,
        other => Err(CastError::UnknownEvent(other.to_string())),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(peer = %peer_id, event = %event, error = %e, "Request failed");
            } else {
                tracing::warn!(peer = %peer_id, event = %event, code = e.error_code(), error = %e, "Request failed");
            }
            Envelope::error(id, &e)
        }
    }
}

async fn get_router_rtp_capabilities(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let capabilities = state.engine.rtp_capabilities();
    let channel = state.registry.write().await.mark_capabilities_requested(peer_id)?;
    tracing::debug!(peer = %peer_id, state = ?channel, "Router capabilities sent");
    Envelope::reply(events::ROUTER_RTP_CAPABILITIES, request.id.clone(), capabilities)
}

async fn create_webrtc_transport(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: CreateWebRtcTransportRequest = request.payload()?;
    if !state.registry.read().await.contains(peer_id) {
        return Err(CastError::PeerNotFound(peer_id.clone()));
    }

    let info = state
        .engine
        .create_transport(TransportKind::WebRtc(req.direction), TransportOptions::default())
        .await?;

    let attached = state.registry.write().await.attach_transport(
        peer_id,
        info.id.clone(),
        TransportRecord {
            direction: req.direction,
        },
    );
    let channel = match attached {
        Ok(channel) => channel,
        Err(e) => {
            let _ = state.engine.close_transport(&info.id).await;
            return Err(e);
        }
    };

    tracing::info!(
        peer = %peer_id,
        transport = %info.id,
        direction = ?req.direction,
        state = ?channel,
        "WebRTC transport created"
    );

    let (Some(ice_parameters), Some(dtls_parameters)) = (info.ice_parameters, info.dtls_parameters) else {
        return Err(CastError::Internal(anyhow::anyhow!(
            "engine returned a WebRTC transport without ICE/DTLS parameters"
        )));
    };

    Envelope::reply(
        events::WEBRTC_TRANSPORT_CREATED,
        request.id.clone(),
        WebRtcTransportCreated {
            id: info.id,
            ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters,
        },
    )
}

async fn connect_webrtc_transport(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: ConnectWebRtcTransportRequest = request.payload()?;
    state.registry.read().await.transport_of(peer_id, &req.transport_id)?;

    state
        .engine
        .connect_transport(&req.transport_id, ConnectParams::Dtls(req.dtls_parameters))
        .await?;

    tracing::debug!(peer = %peer_id, transport = %req.transport_id, "WebRTC transport connected");
    Envelope::reply(events::WEBRTC_TRANSPORT_CONNECTED, request.id.clone(), json!({}))
}

async fn produce(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: ProduceRequest = request.payload()?;
    state.registry.read().await.transport_of(peer_id, &req.transport_id)?;

    let producer = state
        .engine
        .produce(&req.transport_id, req.kind, req.rtp_parameters, req.app_data)
        .await?;

    let notified = {
        let mut registry = state.registry.write().await;
        let attached = registry.attach_producer(
            peer_id,
            producer.id.clone(),
            ProducerRecord {
                transport_id: req.transport_id.clone(),
                kind: producer.kind,
            },
        );
        match attached {
            Ok(()) => {
                let mut directory = state.directory.write().await;
                Ok(directory.add(producer.id.clone(), peer_id.clone(), producer.kind, &registry))
            }
            Err(e) => Err(e),
        }
    };
    let notified = match notified {
        Ok(n) => n,
        Err(e) => {
            let _ = state.engine.close_producer(&producer.id).await;
            return Err(e);
        }
    };

    tracing::info!(
        peer = %peer_id,
        producer = %producer.id,
        kind = %producer.kind,
        notified,
        "Producer created"
    );

    Envelope::reply(events::PRODUCED, request.id.clone(), Produced { id: producer.id })
}

/// The consume stays registered as in flight while the engine works, so a
/// close of the consumer that lands before its record exists is not lost.
async fn consume(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: ConsumeRequest = request.payload()?;
    {
        let mut registry = state.registry.write().await;
        registry.transport_of(peer_id, &req.transport_id)?;
        let directory = state.directory.read().await;
        let entry = directory
            .get(&req.producer_id)
            .ok_or_else(|| CastError::ProducerNotFound(req.producer_id.clone()))?;
        if &entry.peer_id == peer_id {
            return Err(CastError::CannotConsumeOwnProducer(req.producer_id.clone()));
        }
        registry.begin_consume(&req.producer_id);
    }

    let created = state
        .engine
        .consume(
            &req.transport_id,
            ConsumeOptions {
                producer_id: req.producer_id.clone(),
                rtp_capabilities: req.rtp_capabilities,
                paused: true,
            },
        )
        .await;

    let consumer = {
        let mut registry = state.registry.write().await;
        let closed = registry.finish_consume(&req.producer_id, created.as_ref().ok().map(|c| &c.id));
        let consumer = created?;
        let live = state.directory.read().await.get(&req.producer_id).is_some();
        if closed || !live {
            // The engine closes or has closed this consumer with its producer.
            tracing::debug!(
                peer = %peer_id,
                consumer = %consumer.id,
                producer = %req.producer_id,
                "Producer closed while consuming"
            );
            return Err(CastError::ProducerNotFound(req.producer_id.clone()));
        }
        registry.attach_consumer(
            peer_id,
            consumer.id.clone(),
            ConsumerRecord {
                producer_id: consumer.producer_id.clone(),
                transport_id: consumer.transport_id.clone(),
                paused: consumer.paused,
            },
        )?;
        consumer
    };

    tracing::info!(
        peer = %peer_id,
        consumer = %consumer.id,
        producer = %consumer.producer_id,
        kind = %consumer.kind,
        "Consumer created"
    );

    Envelope::reply(
        events::CONSUMED,
        request.id.clone(),
        Consumed {
            id: consumer.id,
            producer_id: consumer.producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            paused: consumer.paused,
        },
    )
}

/// A second resume of an already active consumer is acknowledged with
/// `resumed: false` and never reaches the engine.
async fn resume_consumer(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: ResumeConsumerRequest = request.payload()?;
    let paused = state.registry.read().await.consumer_of(peer_id, &req.consumer_id)?.paused;

    if paused {
        state.engine.resume_consumer(&req.consumer_id).await?;
        state
            .registry
            .write()
            .await
            .set_consumer_paused(peer_id, &req.consumer_id, false)?;
        tracing::debug!(peer = %peer_id, consumer = %req.consumer_id, "Consumer resumed");
    }

    Envelope::reply(
        events::CONSUMER_RESUMED,
        request.id.clone(),
        ConsumerResumed {
            consumer_id: req.consumer_id,
            resumed: paused,
        },
    )
}

async fn close_producer(state: &SfuState, peer_id: &PeerId, request: &Envelope) -> CastResult<Envelope> {
    let req: CloseProducerRequest = request.payload()?;
    state.registry.read().await.producer_of(peer_id, &req.producer_id)?;

    state.engine.close_producer(&req.producer_id).await?;

    let remaining = {
        let mut registry = state.registry.write().await;
        registry.detach_producer(peer_id, &req.producer_id);
        let mut directory = state.directory.write().await;
        directory.remove(&req.producer_id)
    };

    tracing::info!(peer = %peer_id, producer = %req.producer_id, ?remaining, "Producer closed");
    Envelope::reply(
        events::PRODUCER_CLOSED,
        request.id.clone(),
        ProducerClosed {
            producer_id: req.producer_id,
        },
    )
}

/// Forwards engine-initiated consumer closes to the consumer's owner.
pub fn spawn_engine_listener(state: Arc<SfuState>) -> JoinHandle<()> {
    let mut engine_events = state.engine.subscribe();
    tokio::spawn(async move {
        loop {
            match engine_events.recv().await {
                Ok(EngineEvent::ConsumerClosed {
                    consumer_id,
                    producer_id,
                    reason,
                }) => {
                    let mut registry = state.registry.write().await;
                    let Some(owner) = registry.consumer_owner(&consumer_id).map(|s| s.peer_id.clone()) else {
                        if registry.record_unowned_close(&producer_id, &consumer_id) {
                            tracing::debug!(consumer = %consumer_id, producer = %producer_id, "Consumer closed before it was recorded");
                        } else {
                            tracing::trace!(consumer = %consumer_id, "Closed consumer has no signaling owner");
                        }
                        continue;
                    };
                    registry.detach_consumer(&owner, &consumer_id);
                    let notice = ConsumerClosed {
                        consumer_id: consumer_id.clone(),
                        producer_id,
                        reason: reason.as_str().to_string(),
                    };
                    match (registry.get(&owner), Envelope::event(events::CONSUMER_CLOSED, notice)) {
                        (Some(session), Ok(envelope)) => {
                            session.outbound.try_push(envelope);
                        }
                        (_, Err(e)) => tracing::error!(error = %e, "Failed to encode consumer-closed"),
                        (None, _) => {}
                    }
                    tracing::debug!(peer = %owner, consumer = %consumer_id, reason = reason.as_str(), "Consumer closed");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Engine event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use castkit_common::MediaKind;
    use castkit_common::config::{MediaConfig, SignalingConfig};
    use castkit_common::media::{RtpCodecParameters, RtpParameters};
    use async_trait::async_trait;
    use castkit_common::media::RtpCapabilities;
    use castkit_common::{ConsumerId, ProducerId, TransportId};
    use castkit_media::{ConsumerInfo, LocalEngine, MediaEngine, ProducerInfo, SharedEngine, TransportInfo};
    use serde_json::{Map, Value};
    use std::time::Duration;
    use tokio::sync::watch;

    fn local_engine() -> LocalEngine {
        LocalEngine::new(&MediaConfig {
            listen_ip: "127.0.0.1".into(),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 40100,
        })
        .unwrap()
    }

    fn state_with(engine: SharedEngine, outbound_queue_capacity: usize) -> Arc<SfuState> {
        SfuState::new(
            engine,
            SignalingConfig {
                outbound_queue_capacity,
                request_timeout_ms: 1000,
            },
            None,
        )
    }

    fn state() -> Arc<SfuState> {
        state_with(Arc::new(local_engine()), 64)
    }

    /// Closes the producer right after creating a consumer for it, before
    /// the handler gets to record that consumer.
    struct ProducerClosesMidConsume {
        inner: LocalEngine,
        /// How long to stall before handing the consumer back.
        stall: Option<Duration>,
    }

    #[async_trait]
    impl MediaEngine for ProducerClosesMidConsume {
        fn rtp_capabilities(&self) -> RtpCapabilities {
            self.inner.rtp_capabilities()
        }

        async fn create_transport(&self, kind: TransportKind, options: TransportOptions) -> CastResult<TransportInfo> {
            self.inner.create_transport(kind, options).await
        }

        async fn connect_transport(&self, transport_id: &TransportId, params: ConnectParams) -> CastResult<()> {
            self.inner.connect_transport(transport_id, params).await
        }

        async fn produce(
            &self,
            transport_id: &TransportId,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
            app_data: Value,
        ) -> CastResult<ProducerInfo> {
            self.inner.produce(transport_id, kind, rtp_parameters, app_data).await
        }

        async fn consume(&self, transport_id: &TransportId, options: ConsumeOptions) -> CastResult<ConsumerInfo> {
            let producer_id = options.producer_id.clone();
            let consumer = self.inner.consume(transport_id, options).await?;
            self.inner.close_producer(&producer_id).await?;
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            Ok(consumer)
        }

        async fn resume_consumer(&self, consumer_id: &ConsumerId) -> CastResult<()> {
            self.inner.resume_consumer(consumer_id).await
        }

        async fn close_producer(&self, producer_id: &ProducerId) -> CastResult<()> {
            self.inner.close_producer(producer_id).await
        }

        async fn close_transport(&self, transport_id: &TransportId) -> CastResult<()> {
            self.inner.close_transport(transport_id).await
        }

        fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
            self.inner.subscribe()
        }

        fn liveness(&self) -> watch::Receiver<bool> {
            self.inner.liveness()
        }
    }

    /// Alice publishes one video producer and Bob asks to consume it.
    async fn bob_consumes_alice(state: &SfuState) -> (Envelope, OutboundReceiver, String) {
        let alice: PeerId = "alice".into();
        let bob: PeerId = "bob".into();
        let _a = connect(state, alice.clone()).await.unwrap();
        let (_b, brx) = connect(state, bob.clone()).await.unwrap();
        let send = transport(state, &alice, "send").await;
        let producer = produce_video(state, &alice, &send).await;
        let recv = transport(state, &bob, "recv").await;
        let reply = dispatch(
            state,
            &bob,
            request(
                events::CONSUME,
                json!({
                    "transportId": recv,
                    "producerId": producer,
                    "rtpCapabilities": state.engine.rtp_capabilities(),
                }),
            ),
        )
        .await;
        (reply, brx, producer)
    }

    fn request(event: &str, data: Value) -> Envelope {
        Envelope::new(event, data, Some(uuid::Uuid::new_v4().to_string()))
    }

    fn vp8() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    async fn transport(state: &SfuState, peer: &PeerId, direction: &str) -> String {
        let reply = dispatch(state, peer, request(events::CREATE_WEBRTC_TRANSPORT, json!({ "direction": direction }))).await;
        assert_eq!(reply.event, events::WEBRTC_TRANSPORT_CREATED, "{reply:?}");
        reply.data["id"].as_str().unwrap().to_string()
    }

    async fn produce_video(state: &SfuState, peer: &PeerId, transport_id: &str) -> String {
        let reply = dispatch(
            state,
            peer,
            request(
                events::PRODUCE,
                json!({ "transportId": transport_id, "kind": "video", "rtpParameters": vp8() }),
            ),
        )
        .await;
        assert_eq!(reply.event, events::PRODUCED, "{reply:?}");
        reply.data["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn replies_echo_the_request_id() {
        let state = state();
        let alice: PeerId = "alice".into();
        let _conn = connect(&state, alice.clone()).await.unwrap();

        let req = request(events::GET_ROUTER_RTP_CAPABILITIES, Value::Null);
        let reply = dispatch(&state, &alice, req.clone()).await;
        assert_eq!(reply.event, events::ROUTER_RTP_CAPABILITIES);
        assert_eq!(reply.id, req.id);
        assert!(!reply.data["codecs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_events_get_an_error_reply() {
        let state = state();
        let alice: PeerId = "alice".into();
        let _conn = connect(&state, alice.clone()).await.unwrap();

        let reply = handle_text(&state, &alice, r#"{"event":"teleport","data":{},"id":"9"}"#).await;
        assert!(reply.is_error());
        assert_eq!(reply.id.as_deref(), Some("9"));
        assert_eq!(reply.data["code"], "UNKNOWN_EVENT");

        let reply = handle_text(&state, &alice, "{").await;
        assert_eq!(reply.data["code"], "MALFORMED_MESSAGE");
    }

    #[tokio::test]
    async fn foreign_transports_are_rejected() {
        let state = state();
        let alice: PeerId = "alice".into();
        let bob: PeerId = "bob".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let _b = connect(&state, bob.clone()).await.unwrap();

        let alice_send = transport(&state, &alice, "send").await;
        let reply = dispatch(
            &state,
            &bob,
            request(events::PRODUCE, json!({ "transportId": alice_send, "kind": "video", "rtpParameters": vp8() })),
        )
        .await;
        assert_eq!(reply.data["code"], "TRANSPORT_NOT_FOUND");
    }

    #[tokio::test]
    async fn own_producer_cannot_be_consumed() {
        let state = state();
        let alice: PeerId = "alice".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        let recv = transport(&state, &alice, "recv").await;
        let producer = produce_video(&state, &alice, &send).await;

        let reply = dispatch(
            &state,
            &alice,
            request(
                events::CONSUME,
                json!({
                    "transportId": recv,
                    "producerId": producer,
                    "rtpCapabilities": state.engine.rtp_capabilities(),
                }),
            ),
        )
        .await;
        assert_eq!(reply.data["code"], "CANNOT_CONSUME_OWN_PRODUCER");
    }

    #[tokio::test]
    async fn resume_is_acknowledged_twice_but_applied_once() {
        let state = state();
        let alice: PeerId = "alice".into();
        let bob: PeerId = "bob".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let _b = connect(&state, bob.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        let producer = produce_video(&state, &alice, &send).await;
        let recv = transport(&state, &bob, "recv").await;

        let consumed = dispatch(
            &state,
            &bob,
            request(
                events::CONSUME,
                json!({
                    "transportId": recv,
                    "producerId": producer,
                    "rtpCapabilities": state.engine.rtp_capabilities(),
                }),
            ),
        )
        .await;
        assert_eq!(consumed.event, events::CONSUMED);
        assert_eq!(consumed.data["paused"], true);
        let consumer_id = consumed.data["id"].clone();

        let first = dispatch(&state, &bob, request(events::RESUME_CONSUMER, json!({ "consumerId": consumer_id }))).await;
        assert_eq!(first.data["resumed"], true);
        let second = dispatch(&state, &bob, request(events::RESUME_CONSUMER, json!({ "consumerId": consumer_id }))).await;
        assert_eq!(second.event, events::CONSUMER_RESUMED);
        assert_eq!(second.data["resumed"], false);
    }

    #[tokio::test]
    async fn disconnect_removes_every_owned_producer_once() {
        let state = state();
        let alice: PeerId = "alice".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        for _ in 0..3 {
            produce_video(&state, &alice, &send).await;
        }
        assert_eq!(state.directory.read().await.len(), 3);
        assert!(state.is_consistent().await);

        let removed = disconnect(&state, &alice).await.unwrap();
        assert_eq!(removed.producer_ids.len(), 3);
        assert!(state.directory.read().await.is_empty());
        assert!(disconnect(&state, &alice).await.is_none());
        assert!(state.is_consistent().await);
    }

    #[tokio::test]
    async fn backfill_announces_each_foreign_producer_once() {
        let state = state();
        let alice: PeerId = "alice".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        let p1 = produce_video(&state, &alice, &send).await;
        let p2 = produce_video(&state, &alice, &send).await;

        let (_tx, mut rx) = connect(&state, "bob".into()).await.unwrap();
        let mut announced = Vec::new();
        while let Some(env) = rx.try_recv() {
            assert_eq!(env.event, events::NEW_PRODUCER);
            announced.push(env.data["producerId"].as_str().unwrap().to_string());
        }
        announced.sort();
        let mut expected = vec![p1, p2];
        expected.sort();
        assert_eq!(announced, expected);
    }

    #[tokio::test]
    async fn closing_a_producer_notifies_its_consumers() {
        let state = state();
        let listener = spawn_engine_listener(state.clone());
        let alice: PeerId = "alice".into();
        let bob: PeerId = "bob".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let (_btx, mut brx) = connect(&state, bob.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        let producer = produce_video(&state, &alice, &send).await;
        let recv = transport(&state, &bob, "recv").await;
        let consumed = dispatch(
            &state,
            &bob,
            request(
                events::CONSUME,
                json!({
                    "transportId": recv,
                    "producerId": producer,
                    "rtpCapabilities": state.engine.rtp_capabilities(),
                }),
            ),
        )
        .await;
        assert_eq!(consumed.event, events::CONSUMED);

        let reply = dispatch(&state, &alice, request(events::CLOSE_PRODUCER, json!({ "producerId": producer }))).await;
        assert_eq!(reply.event, events::PRODUCER_CLOSED);
        assert!(state.directory.read().await.is_empty());

        // new-producer first, then consumer-closed from the engine listener.
        let first = brx.recv().await.unwrap();
        assert_eq!(first.event, events::NEW_PRODUCER);
        let closed = brx.recv().await.unwrap();
        assert_eq!(closed.event, events::CONSUMER_CLOSED);
        assert_eq!(closed.data["producerId"], producer.as_str());
        assert_eq!(closed.data["reason"], "producerclose");
        assert!(state.registry.read().await.get(&bob).unwrap().consumers.is_empty());

        listener.abort();
    }

    #[tokio::test]
    async fn mismatched_capabilities_create_no_consumer() {
        let state = state();
        let alice: PeerId = "alice".into();
        let bob: PeerId = "bob".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let _b = connect(&state, bob.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        let producer = produce_video(&state, &alice, &send).await;
        let recv = transport(&state, &bob, "recv").await;

        let mut caps = state.engine.rtp_capabilities();
        caps.codecs.retain(|c| c.kind == MediaKind::Audio);
        let reply = dispatch(
            &state,
            &bob,
            request(
                events::CONSUME,
                json!({ "transportId": recv, "producerId": producer, "rtpCapabilities": caps }),
            ),
        )
        .await;
        assert_eq!(reply.data["code"], "CAPABILITY_MISMATCH");
        assert!(state.registry.read().await.get(&bob).unwrap().consumers.is_empty());
    }

    #[tokio::test]
    async fn backfill_larger_than_the_queue_is_delivered_in_full() {
        let state = state_with(Arc::new(local_engine()), 2);
        let alice: PeerId = "alice".into();
        let _a = connect(&state, alice.clone()).await.unwrap();
        let send = transport(&state, &alice, "send").await;
        for _ in 0..3 {
            produce_video(&state, &alice, &send).await;
        }

        let (bob_tx, mut bob_rx) = connect(&state, "bob".into()).await.unwrap();
        let mut announced = 0;
        while let Some(env) = bob_rx.try_recv() {
            assert_eq!(env.event, events::NEW_PRODUCER);
            announced += 1;
        }
        assert_eq!(announced, 3);
        assert!(!bob_tx.is_disconnected());

        // The configured headroom is still there for live traffic.
        produce_video(&state, &alice, &send).await;
        assert_eq!(bob_rx.try_recv().unwrap().event, events::NEW_PRODUCER);
        assert!(!bob_tx.is_disconnected());
    }

    #[tokio::test]
    async fn consumer_closed_before_it_is_recorded_is_refused() {
        let engine = ProducerClosesMidConsume {
            inner: local_engine(),
            stall: Some(Duration::from_millis(100)),
        };
        let state = state_with(Arc::new(engine), 64);
        let listener = spawn_engine_listener(state.clone());

        let (reply, mut brx, producer) = bob_consumes_alice(&state).await;
        assert!(reply.is_error(), "{reply:?}");
        assert_eq!(reply.data["code"], "PRODUCER_NOT_FOUND");
        assert!(state.registry.read().await.get(&"bob".into()).unwrap().consumers.is_empty());

        // Bob only ever heard about the producer.
        assert_eq!(brx.try_recv().unwrap().data["producerId"], producer.as_str());
        assert!(brx.try_recv().is_none());
        assert!(state.is_consistent().await);

        listener.abort();
    }

    #[tokio::test]
    async fn consumer_closed_right_after_it_is_recorded_is_reported() {
        let engine = ProducerClosesMidConsume { inner: local_engine(), stall: None };
        let state = state_with(Arc::new(engine), 64);
        let listener = spawn_engine_listener(state.clone());

        let (reply, mut brx, _producer) = bob_consumes_alice(&state).await;
        assert_eq!(brx.recv().await.unwrap().event, events::NEW_PRODUCER);

        if reply.event == events::CONSUMED {
            let closed = tokio::time::timeout(Duration::from_secs(1), brx.recv()).await.unwrap().unwrap();
            assert_eq!(closed.event, events::CONSUMER_CLOSED);
            assert_eq!(closed.data["consumerId"], reply.data["id"]);
        } else {
            assert_eq!(reply.data["code"], "PRODUCER_NOT_FOUND");
        }

        // Either way Bob keeps no record of a consumer the engine closed.
        assert!(state.registry.read().await.get(&"bob".into()).unwrap().consumers.is_empty());
        listener.abort();
    }
}
