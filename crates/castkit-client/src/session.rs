//! Client-side channel state and the pending-producer queue.
//!
//! Producers announced before both transports exist cannot be consumed yet.
//! They are held here and released, in arrival order, once the channel
//! becomes ready.

use castkit_common::media::TransportDirection;
use castkit_common::protocol::NewProducer;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    CapabilitiesRequested,
    /// Send and receive transports both exist.
    Ready,
    Closed,
}

#[derive(Debug)]
pub struct ClientSession {
    state: ChannelState,
    has_send: bool,
    has_recv: bool,
    queued: VecDeque<NewProducer>,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Connected,
            has_send: false,
            has_recv: false,
            queued: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn capabilities_requested(&mut self) {
        if self.state == ChannelState::Connected {
            self.state = ChannelState::CapabilitiesRequested;
        }
    }

    /// Records a new transport. Returns the queued producers if this made the channel ready.
    pub fn transport_created(&mut self, direction: TransportDirection) -> Vec<NewProducer> {
        match direction {
            TransportDirection::Send => self.has_send = true,
            TransportDirection::Recv => self.has_recv = true,
        }
        if self.has_send && self.has_recv && self.state != ChannelState::Ready && self.state != ChannelState::Closed {
            self.state = ChannelState::Ready;
            return self.queued.drain(..).collect();
        }
        Vec::new()
    }

    /// Returns the producer if it can be consumed now, otherwise queues it.
    pub fn on_new_producer(&mut self, producer: NewProducer) -> Option<NewProducer> {
        match self.state {
            ChannelState::Ready => Some(producer),
            ChannelState::Closed => None,
            _ => {
                self.queued.push_back(producer);
                None
            }
        }
    }

    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
        self.queued.clear();
    }
}
