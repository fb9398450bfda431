//! Session registry: every connected peer and the media objects it owns.

use crate::outbound::Outbound;
use castkit_common::media::TransportDirection;
use castkit_common::{CastError, CastResult, ConsumerId, MediaKind, PeerId, ProducerId, TransportId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Where a signaling channel is in its negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    CapabilitiesRequested,
    /// Both a send and a receive transport exist.
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRecord {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub transport_id: TransportId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub paused: bool,
}

/// One connected peer.
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub outbound: Outbound,
    pub transports: HashMap<TransportId, TransportRecord>,
    pub producers: HashMap<ProducerId, ProducerRecord>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
    pub state: ChannelState,
    pub connected_at: DateTime<Utc>,
}

impl PeerSession {
    fn new(peer_id: PeerId, outbound: Outbound) -> Self {
        Self {
            peer_id,
            outbound,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            state: ChannelState::Connected,
            connected_at: Utc::now(),
        }
    }

    fn has_direction(&self, direction: TransportDirection) -> bool {
        self.transports.values().any(|t| t.direction == direction)
    }

    fn refresh_state(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        if self.has_direction(TransportDirection::Send) && self.has_direction(TransportDirection::Recv) {
            self.state = ChannelState::Ready;
        }
    }
}

/// What a departing peer left behind, for the caller to clean up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedPeer {
    pub peer_id: PeerId,
    pub transport_ids: Vec<TransportId>,
    pub producer_ids: Vec<ProducerId>,
    pub connected_at: DateTime<Utc>,
}

/// Consumes of one producer awaiting the engine, and the consumers the
/// engine closed before any of them was recorded.
#[derive(Debug, Default)]
struct PendingConsumes {
    in_flight: usize,
    closed: HashSet<ConsumerId>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: HashMap<PeerId, PeerSession>,
    pending: HashMap<ProducerId, PendingConsumes>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// An id already in use is rejected and the existing session is left untouched.
    pub fn register(&mut self, peer_id: PeerId, outbound: Outbound) -> CastResult<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(CastError::DuplicatePeer(peer_id));
        }
        self.peers.insert(peer_id.clone(), PeerSession::new(peer_id, outbound));
        Ok(())
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn session_mut(&mut self, peer_id: &PeerId) -> CastResult<&mut PeerSession> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| CastError::PeerNotFound(peer_id.clone()))
    }

    fn session(&self, peer_id: &PeerId) -> CastResult<&PeerSession> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| CastError::PeerNotFound(peer_id.clone()))
    }

    pub fn state(&self, peer_id: &PeerId) -> CastResult<ChannelState> {
        Ok(self.session(peer_id)?.state)
    }

    pub fn mark_capabilities_requested(&mut self, peer_id: &PeerId) -> CastResult<ChannelState> {
        let session = self.session_mut(peer_id)?;
        if session.state == ChannelState::Connected {
            session.state = ChannelState::CapabilitiesRequested;
        }
        Ok(session.state)
    }

    /// Returns the channel state after the transport was added.
    pub fn attach_transport(
        &mut self,
        peer_id: &PeerId,
        transport_id: TransportId,
        record: TransportRecord,
    ) -> CastResult<ChannelState> {
        let session = self.session_mut(peer_id)?;
        session.transports.insert(transport_id, record);
        session.refresh_state();
        Ok(session.state)
    }

    pub fn attach_producer(
        &mut self,
        peer_id: &PeerId,
        producer_id: ProducerId,
        record: ProducerRecord,
    ) -> CastResult<()> {
        self.session_mut(peer_id)?.producers.insert(producer_id, record);
        Ok(())
    }

    pub fn attach_consumer(
        &mut self,
        peer_id: &PeerId,
        consumer_id: ConsumerId,
        record: ConsumerRecord,
    ) -> CastResult<()> {
        self.session_mut(peer_id)?.consumers.insert(consumer_id, record);
        Ok(())
    }

    /// The transport, if `peer_id` owns it.
    pub fn transport_of(&self, peer_id: &PeerId, transport_id: &TransportId) -> CastResult<TransportRecord> {
        self.session(peer_id)?
            .transports
            .get(transport_id)
            .copied()
            .ok_or_else(|| CastError::TransportNotFound(transport_id.clone()))
    }

    pub fn producer_of(&self, peer_id: &PeerId, producer_id: &ProducerId) -> CastResult<&ProducerRecord> {
        self.session(peer_id)?
            .producers
            .get(producer_id)
            .ok_or_else(|| CastError::ProducerNotFound(producer_id.clone()))
    }

    pub fn consumer_of(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> CastResult<&ConsumerRecord> {
        self.session(peer_id)?
            .consumers
            .get(consumer_id)
            .ok_or_else(|| CastError::ConsumerNotFound(consumer_id.clone()))
    }

    pub fn set_consumer_paused(&mut self, peer_id: &PeerId, consumer_id: &ConsumerId, paused: bool) -> CastResult<()> {
        let record = self
            .session_mut(peer_id)?
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| CastError::ConsumerNotFound(consumer_id.clone()))?;
        record.paused = paused;
        Ok(())
    }

    pub fn detach_producer(&mut self, peer_id: &PeerId, producer_id: &ProducerId) -> Option<ProducerRecord> {
        self.peers.get_mut(peer_id)?.producers.remove(producer_id)
    }

    pub fn detach_consumer(&mut self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        self.peers.get_mut(peer_id)?.consumers.remove(consumer_id)
    }

    /// Marks a consume of `producer_id` as awaiting the engine.
    pub fn begin_consume(&mut self, producer_id: &ProducerId) {
        self.pending.entry(producer_id.clone()).or_default().in_flight += 1;
    }

    /// Ends a consume started with [`begin_consume`](Self::begin_consume).
    /// Returns `true` if the engine already closed `consumer_id`.
    pub fn finish_consume(&mut self, producer_id: &ProducerId, consumer_id: Option<&ConsumerId>) -> bool {
        let Some(pending) = self.pending.get_mut(producer_id) else {
            return false;
        };
        let closed = consumer_id.is_some_and(|id| pending.closed.remove(id));
        pending.in_flight = pending.in_flight.saturating_sub(1);
        if pending.in_flight == 0 {
            self.pending.remove(producer_id);
        }
        closed
    }

    /// Remembers a close for a consumer nobody owns yet. Returns `false`
    /// when no consume of `producer_id` is in flight, so no record can follow.
    pub fn record_unowned_close(&mut self, producer_id: &ProducerId, consumer_id: &ConsumerId) -> bool {
        match self.pending.get_mut(producer_id) {
            Some(pending) => {
                pending.closed.insert(consumer_id.clone());
                true
            }
            None => false,
        }
    }

    /// Owner of a consumer, used when the engine closes one on its own.
    pub fn consumer_owner(&self, consumer_id: &ConsumerId) -> Option<&PeerSession> {
        self.peers.values().find(|s| s.consumers.contains_key(consumer_id))
    }

    /// Every producer id owned by any peer.
    pub fn producer_ids(&self) -> BTreeSet<ProducerId> {
        self.peers
            .values()
            .flat_map(|s| s.producers.keys().cloned())
            .collect()
    }

    /// Removes the peer. A second call for the same id returns `None`.
    pub fn unregister(&mut self, peer_id: &PeerId) -> Option<RemovedPeer> {
        let mut session = self.peers.remove(peer_id)?;
        session.state = ChannelState::Closed;
        let mut transport_ids: Vec<_> = session.transports.into_keys().collect();
        let mut producer_ids: Vec<_> = session.producers.into_keys().collect();
        transport_ids.sort();
        producer_ids.sort();
        Some(RemovedPeer {
            peer_id: session.peer_id,
            transport_ids,
            producer_ids,
            connected_at: session.connected_at,
        })
    }
}
