//! Per-channel outbound queue.
//!
//! Every frame a peer receives goes through one bounded queue drained by the
//! connection's sender task. Replies are pushed with backpressure from the
//! peer's own receive loop. Broadcasts use [`Outbound::try_push`] while shared
//! locks are held and never wait: a peer whose queue is full is disconnected.

use castkit_common::PeerId;
use castkit_common::protocol::Envelope;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Sending half, cloned into the registry and the connection task.
#[derive(Debug, Clone)]
pub struct Outbound {
    peer_id: PeerId,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

/// Receiving half, owned by the connection's sender task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
}

pub fn channel(peer_id: PeerId, capacity: usize) -> (Outbound, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();
    (
        Outbound {
            peer_id,
            tx,
            cancel: cancel.clone(),
        },
        OutboundReceiver { rx, cancel },
    )
}

impl Outbound {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Non-blocking enqueue for broadcasts. Returns `false` if the frame was
    /// not queued; a full queue also disconnects the peer.
    pub fn try_push(&self, envelope: Envelope) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    peer = %self.peer_id,
                    event = %dropped.event,
                    "Outbound queue full, disconnecting peer"
                );
                self.cancel.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Enqueue a reply, waiting for room. Returns `false` once the connection is gone.
    pub async fn send(&self, envelope: Envelope) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            res = self.tx.send(envelope) => res.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn disconnected(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

impl OutboundReceiver {
    /// Next frame to write. `None` once the peer was disconnected or every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            envelope = self.rx.recv() => envelope,
        }
    }

    /// Drain without waiting, for tests and diagnostics.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(n: u32) -> Envelope {
        Envelope::new("new-producer", json!({ "n": n }), None)
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (tx, mut rx) = channel("a".into(), 4);
        assert!(tx.try_push(frame(1)));
        assert!(tx.send(frame(2)).await);
        assert_eq!(rx.recv().await.unwrap().data["n"], 1);
        assert_eq!(rx.recv().await.unwrap().data["n"], 2);
    }

    #[tokio::test]
    async fn overflow_disconnects_the_peer() {
        let (tx, mut rx) = channel("slow".into(), 2);
        assert!(tx.try_push(frame(1)));
        assert!(tx.try_push(frame(2)));
        assert!(!tx.try_push(frame(3)));
        assert!(tx.is_disconnected());

        // Further pushes are refused and the receiver stops.
        assert!(!tx.try_push(frame(4)));
        assert!(!tx.send(frame(5)).await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_receiver_closes_the_queue() {
        let (tx, rx) = channel("gone".into(), 2);
        drop(rx);
        assert!(tx.is_disconnected());
        assert!(!tx.try_push(frame(1)));
    }
}
