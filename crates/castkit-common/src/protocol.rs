//! Signaling wire protocol: the `{event, data, id}` envelope and its payloads.
//!
//! Requests and replies share one envelope shape. A reply echoes the `id` of
//! the request it answers; server-initiated events carry no `id`.

use crate::error::CastError;
use crate::ids::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};
use crate::media::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters, TransportDirection,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names used on the wire.
pub mod events {
    // Requests and their replies
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const ROUTER_RTP_CAPABILITIES: &str = "routerRtpCapabilities";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    pub const WEBRTC_TRANSPORT_CREATED: &str = "webRtcTransportCreated";
    pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
    pub const WEBRTC_TRANSPORT_CONNECTED: &str = "webRtcTransportConnected";
    pub const PRODUCE: &str = "produce";
    pub const PRODUCED: &str = "produced";
    pub const CONSUME: &str = "consume";
    pub const CONSUMED: &str = "consumed";
    pub const RESUME_CONSUMER: &str = "resume-consumer";
    pub const CONSUMER_RESUMED: &str = "consumer-resumed";
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";

    // Server-initiated
    pub const NEW_PRODUCER: &str = "new-producer";
    pub const CONSUMER_CLOSED: &str = "consumer-closed";
    pub const ERROR: &str = "error";
}

/// One signaling frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// A request (or a reply, when `id` echoes a request).
    pub fn new(event: impl Into<String>, data: Value, id: Option<String>) -> Self {
        Self {
            event: event.into(),
            data,
            id,
        }
    }

    /// Unsolicited server event, no correlation id.
    pub fn event(event: &str, data: impl Serialize) -> Result<Self, CastError> {
        Ok(Self::new(event, serde_json::to_value(data)?, None))
    }

    /// Reply to the request carrying `id`.
    pub fn reply(event: &str, id: Option<String>, data: impl Serialize) -> Result<Self, CastError> {
        Ok(Self::new(event, serde_json::to_value(data)?, id))
    }

    pub fn error(id: Option<String>, err: &CastError) -> Self {
        let payload = ErrorPayload {
            code: err.error_code().to_string(),
            message: err.client_message(),
        };
        // ErrorPayload is two strings; serialization cannot fail.
        let data = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(events::ERROR, data, id)
    }

    /// Strict parse of an inbound text frame.
    ///
    /// On failure the returned id is whatever could still be salvaged from the
    /// raw JSON, so the error reply can be correlated.
    pub fn parse(text: &str) -> Result<Self, (Option<String>, CastError)> {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                let id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_owned));
                Err((id, CastError::MalformedMessage(e.to_string())))
            }
        }
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, CastError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| CastError::MalformedMessage(format!("{}: {e}", self.event)))
    }

    pub fn is_error(&self) -> bool {
        self.event == events::ERROR
    }

    pub fn to_json(&self) -> String {
        // Envelope is String + Value + Option<String>; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

// ── Request payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebRtcTransportRequest {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWebRtcTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    pub producer_id: ProducerId,
}

// ── Reply payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportCreated {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Produced {
    pub id: ProducerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumed {
    pub consumer_id: ConsumerId,
    /// `false` when the consumer was already active and nothing changed.
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
}

// ── Server-initiated payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unsolicited_events_omit_id() {
        let env = Envelope::event(
            events::NEW_PRODUCER,
            NewProducer {
                producer_id: "p1".into(),
                peer_id: "alice".into(),
                kind: MediaKind::Video,
            },
        )
        .unwrap();
        let wire: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert!(wire.get("id").is_none());
        assert_eq!(wire["data"]["producerId"], "p1");
        assert_eq!(wire["data"]["kind"], "video");
    }

    #[test]
    fn error_reply_keeps_request_id() {
        let env = Envelope::error(Some("42".into()), &CastError::ProducerNotFound("p9".into()));
        assert_eq!(env.id.as_deref(), Some("42"));
        assert!(env.is_error());
        assert_eq!(env.data["code"], "PRODUCER_NOT_FOUND");
    }

    #[test]
    fn malformed_frames_salvage_the_id() {
        let (id, err) = Envelope::parse(r#"{"id":"7","data":{}}"#).unwrap_err();
        assert_eq!(id.as_deref(), Some("7"));
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");

        let (id, _) = Envelope::parse("not json").unwrap_err();
        assert!(id.is_none());
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let env = Envelope::parse(r#"{"event":"getRouterRtpCapabilities","id":"1"}"#).unwrap();
        assert!(env.data.is_null());
    }

    #[test]
    fn payload_errors_name_the_event() {
        let env = Envelope::new(events::CONSUME, json!({ "transportId": "t1" }), Some("3".into()));
        let err = env.payload::<ConsumeRequest>().unwrap_err();
        assert!(err.to_string().contains("consume"));
    }

    #[test]
    fn direction_accepts_receive_alias() {
        let req: CreateWebRtcTransportRequest =
            serde_json::from_value(json!({ "direction": "receive" })).unwrap();
        assert_eq!(req.direction, TransportDirection::Recv);
    }
}
