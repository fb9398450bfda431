//! Async signaling client for a castkit relay.

use std::sync::Arc;
use std::time::Duration;

use castkit_common::media::{DtlsParameters, RtpCapabilities, RtpParameters, TransportDirection};
use castkit_common::protocol::{
    events, CloseProducerRequest, ConnectWebRtcTransportRequest, ConsumeRequest, Consumed, ConsumerClosed,
    ConsumerResumed, CreateWebRtcTransportRequest, Envelope, ErrorPayload, NewProducer, ProduceRequest, Produced,
    ProducerClosed, ResumeConsumerRequest, WebRtcTransportCreated,
};
use castkit_common::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::correlation::{PendingRequests, Routed};
use crate::error::{ClientError, Result};
use crate::session::{ChannelState, ClientSession};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A server-initiated event.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A producer that can be consumed now. Announcements that arrive before
    /// both transports exist are held back and delivered once they do.
    NewProducer(NewProducer),
    ConsumerClosed(ConsumerClosed),
    Other(Envelope),
    Disconnected,
}

/// One signaling channel to the relay.
///
/// ```rust,no_run
/// use castkit_client::{ClientEvent, SignalingClient};
///
/// #[tokio::main]
/// async fn main() -> castkit_client::Result<()> {
///     let client = SignalingClient::connect("ws://localhost:3000/ws", "alice").await?;
///     let mut events = client.subscribe();
///     let caps = client.get_router_rtp_capabilities().await?;
///     client.create_webrtc_transport(castkit_common::media::TransportDirection::Recv).await?;
///     client.create_webrtc_transport(castkit_common::media::TransportDirection::Send).await?;
///     while let Ok(ClientEvent::NewProducer(p)) = events.recv().await {
///         println!("{} publishes {:?} ({} codecs available)", p.peer_id, p.kind, caps.codecs.len());
///     }
///     Ok(())
/// }
/// ```
pub struct SignalingClient {
    peer_id: PeerId,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingRequests>,
    session: Arc<Mutex<ClientSession>>,
    events: broadcast::Sender<ClientEvent>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    /// Opens the channel, naming this peer in `Sec-WebSocket-Protocol`.
    pub async fn connect(url: &str, peer_id: impl Into<PeerId>) -> Result<Self> {
        let peer_id = peer_id.into();
        let mut request = url.into_client_request()?;
        let protocol = HeaderValue::from_str(peer_id.as_str())
            .map_err(|e| tungstenite::Error::HttpFormat(tungstenite::http::Error::from(e)))?;
        request.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ClientError::Rejected { status: response.status().as_u16() });
            }
            Err(e) => return Err(e.into()),
        };
        let (mut sink, stream) = ws.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer_peer = peer_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(peer = %writer_peer, error = %e, "Signaling write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pending = Arc::new(PendingRequests::new());
        let session = Arc::new(Mutex::new(ClientSession::new()));
        let (events, _) = broadcast::channel(256);

        let reader = tokio::spawn(read_loop(
            stream,
            peer_id.clone(),
            Arc::clone(&pending),
            Arc::clone(&session),
            events.clone(),
        ));

        Ok(Self {
            peer_id,
            outgoing,
            pending,
            session,
            events,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
            writer,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Subscribe to server-initiated events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ChannelState {
        self.session.lock().await.state()
    }

    /// Sends one request and waits for the frame carrying its id.
    pub async fn request(&self, event: &str, data: impl Serialize) -> Result<Envelope> {
        let data = serde_json::to_value(data)?;
        let (id, reply) = self.pending.register(event, self.request_timeout).await;
        let frame = Envelope::new(event, data, Some(id.clone()));

        if self.outgoing.send(Message::Text(frame.to_json().into())).is_err() {
            self.pending.expire(&id).await;
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, reply).await {
            Ok(Ok(reply)) if reply.is_error() => Err(remote_error(reply.data)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.expire(&id).await;
                Err(ClientError::Timeout {
                    event: event.to_string(),
                    after_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, event: &str, data: impl Serialize, expected: &'static str) -> Result<T> {
        let reply = self.request(event, data).await?;
        if reply.event != expected {
            return Err(ClientError::UnexpectedReply { expected, got: reply.event });
        }
        Ok(serde_json::from_value(reply.data)?)
    }

    pub async fn get_router_rtp_capabilities(&self) -> Result<RtpCapabilities> {
        let caps = self
            .call(events::GET_ROUTER_RTP_CAPABILITIES, Value::Null, events::ROUTER_RTP_CAPABILITIES)
            .await?;
        self.session.lock().await.capabilities_requested();
        Ok(caps)
    }

    /// Creates a transport. When this completes the send/recv pair, producers
    /// announced so far are delivered as [`ClientEvent::NewProducer`].
    pub async fn create_webrtc_transport(&self, direction: TransportDirection) -> Result<WebRtcTransportCreated> {
        let created: WebRtcTransportCreated = self
            .call(
                events::CREATE_WEBRTC_TRANSPORT,
                CreateWebRtcTransportRequest { direction },
                events::WEBRTC_TRANSPORT_CREATED,
            )
            .await?;

        // Held across the broadcast so released announcements stay ahead of
        // any the reader delivers next.
        let mut session = self.session.lock().await;
        for producer in session.transport_created(direction) {
            let _ = self.events.send(ClientEvent::NewProducer(producer));
        }
        Ok(created)
    }

    pub async fn connect_webrtc_transport(&self, transport_id: TransportId, dtls_parameters: DtlsParameters) -> Result<()> {
        let _: Value = self
            .call(
                events::CONNECT_WEBRTC_TRANSPORT,
                ConnectWebRtcTransportRequest { transport_id, dtls_parameters },
                events::WEBRTC_TRANSPORT_CONNECTED,
            )
            .await?;
        Ok(())
    }

    pub async fn produce(&self, transport_id: TransportId, kind: MediaKind, rtp_parameters: RtpParameters) -> Result<ProducerId> {
        let produced: Produced = self
            .call(
                events::PRODUCE,
                ProduceRequest { transport_id, kind, rtp_parameters, app_data: Value::Null },
                events::PRODUCED,
            )
            .await?;
        Ok(produced.id)
    }

    /// The consumer starts paused; call [`resume_consumer`](Self::resume_consumer) once it is wired up.
    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Consumed> {
        self.call(
            events::CONSUME,
            ConsumeRequest { transport_id, producer_id, rtp_capabilities },
            events::CONSUMED,
        )
        .await
    }

    /// Returns whether the consumer was actually paused before this call.
    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<bool> {
        let resumed: ConsumerResumed = self
            .call(events::RESUME_CONSUMER, ResumeConsumerRequest { consumer_id }, events::CONSUMER_RESUMED)
            .await?;
        Ok(resumed.resumed)
    }

    pub async fn close_producer(&self, producer_id: ProducerId) -> Result<ProducerId> {
        let closed: ProducerClosed = self
            .call(events::CLOSE_PRODUCER, CloseProducerRequest { producer_id }, events::PRODUCER_CLOSED)
            .await?;
        Ok(closed.producer_id)
    }

    /// Sends a close frame and waits briefly for the relay to hang up.
    pub async fn close(mut self) {
        let _ = self.outgoing.send(Message::Close(None));
        if tokio::time::timeout(Duration::from_secs(2), &mut self.reader).await.is_err() {
            debug!(peer = %self.peer_id, "Relay did not close the channel in time");
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn remote_error(data: Value) -> ClientError {
    match serde_json::from_value::<ErrorPayload>(data.clone()) {
        Ok(ErrorPayload { code, message }) => ClientError::Remote { code, message },
        Err(_) => ClientError::Remote {
            code: "UNKNOWN".to_string(),
            message: data.to_string(),
        },
    }
}

async fn read_loop<S>(
    mut stream: S,
    peer_id: PeerId,
    pending: Arc<PendingRequests>,
    session: Arc<Mutex<ClientSession>>,
    event_tx: broadcast::Sender<ClientEvent>,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Signaling read failed");
                break;
            }
        };

        let envelope = match Envelope::parse(text.as_str()) {
            Ok(envelope) => envelope,
            Err((_, e)) => {
                warn!(peer = %peer_id, error = %e, "Ignoring malformed frame from relay");
                continue;
            }
        };

        if let Routed::Unsolicited(envelope) = pending.route(envelope).await {
            deliver(envelope, &peer_id, &session, &event_tx).await;
        }
    }

    pending.fail_all().await;
    session.lock().await.close();
    let _ = event_tx.send(ClientEvent::Disconnected);
    debug!(peer = %peer_id, "Signaling channel closed");
}

async fn deliver(
    envelope: Envelope,
    peer_id: &PeerId,
    session: &Mutex<ClientSession>,
    event_tx: &broadcast::Sender<ClientEvent>,
) {
    match envelope.event.as_str() {
        events::NEW_PRODUCER => match envelope.payload::<NewProducer>() {
            Ok(producer) => {
                let mut session = session.lock().await;
                if let Some(producer) = session.on_new_producer(producer) {
                    let _ = event_tx.send(ClientEvent::NewProducer(producer));
                }
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Bad new-producer payload"),
        },
        events::CONSUMER_CLOSED => match envelope.payload::<ConsumerClosed>() {
            Ok(closed) => {
                let _ = event_tx.send(ClientEvent::ConsumerClosed(closed));
            }
            Err(e) => warn!(peer = %peer_id, error = %e, "Bad consumer-closed payload"),
        },
        _ => {
            let _ = event_tx.send(ClientEvent::Other(envelope));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_frames_become_remote_errors() {
        let err = remote_error(json!({ "code": "UNKNOWN_TRANSPORT", "message": "Transport t1 not found" }));
        assert_eq!(err.code(), Some("UNKNOWN_TRANSPORT"));

        let err = remote_error(json!("boom"));
        assert_eq!(err.code(), Some("UNKNOWN"));
    }

    #[tokio::test]
    async fn announcements_are_held_until_ready() {
        let session = Mutex::new(ClientSession::new());
        let (event_tx, mut rx) = broadcast::channel(8);
        let peer = PeerId::from("bob");
        let frame = Envelope::event(
            events::NEW_PRODUCER,
            NewProducer {
                producer_id: "p1".into(),
                peer_id: "alice".into(),
                kind: MediaKind::Audio,
            },
        )
        .unwrap();

        deliver(frame.clone(), &peer, &session, &event_tx).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.lock().await.queued(), 1);

        {
            let mut s = session.lock().await;
            s.transport_created(TransportDirection::Send);
            assert_eq!(s.transport_created(TransportDirection::Recv).len(), 1);
        }
        deliver(frame, &peer, &session, &event_tx).await;
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::NewProducer(p)) if p.producer_id.as_str() == "p1"));
    }

    #[tokio::test]
    async fn unknown_server_events_pass_through() {
        let session = Mutex::new(ClientSession::new());
        let (event_tx, mut rx) = broadcast::channel(8);
        deliver(Envelope::new("stats", json!({ "rtt": 12 }), None), &"bob".into(), &session, &event_tx).await;
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Other(e)) if e.event == "stats"));
    }
}
