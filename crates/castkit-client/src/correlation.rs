//! Request/response correlation.
//!
//! Every request gets a fresh id and a single-use resolver. Inbound frames are
//! checked against the pending map before anything else, so a reply is never
//! mistaken for an unsolicited event. A reply that shows up after its
//! deadline is dropped.

use castkit_common::protocol::Envelope;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

struct Pending {
    event: String,
    deadline: Instant,
    resolver: oneshot::Sender<Envelope>,
}

/// Where an inbound frame went.
#[derive(Debug)]
pub enum Routed {
    /// Delivered to the waiting request.
    Resolved,
    /// Carried an id nobody is waiting for any more. Discarded.
    Late { id: String },
    /// No id: a server-initiated event.
    Unsolicited(Envelope),
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, Pending>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns its id and the receiver for its reply.
    pub async fn register(&self, event: &str, timeout: Duration) -> (String, oneshot::Receiver<Envelope>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (resolver, rx) = oneshot::channel();
        self.inner.lock().await.insert(
            id.clone(),
            Pending {
                event: event.to_string(),
                deadline: Instant::now() + timeout,
                resolver,
            },
        );
        (id, rx)
    }

    pub async fn route(&self, envelope: Envelope) -> Routed {
        let Some(id) = envelope.id.clone() else {
            return Routed::Unsolicited(envelope);
        };

        let Some(pending) = self.inner.lock().await.remove(&id) else {
            tracing::debug!(id = %id, event = %envelope.event, "Discarding reply with no pending request");
            return Routed::Late { id };
        };

        if Instant::now() > pending.deadline {
            tracing::debug!(id = %id, request = %pending.event, "Discarding reply past its deadline");
            return Routed::Late { id };
        }

        match pending.resolver.send(envelope) {
            Ok(()) => Routed::Resolved,
            Err(_) => Routed::Late { id },
        }
    }

    /// Forget a request whose caller gave up.
    pub async fn expire(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    /// Drop every resolver; waiting callers see the channel as closed.
    pub async fn fail_all(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: &str) -> Envelope {
        Envelope::new("produced", json!({ "id": "p1" }), Some(id.to_string()))
    }

    #[tokio::test]
    async fn reply_resolves_its_request() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register("produce", Duration::from_secs(5)).await;
        assert!(matches!(pending.route(reply(&id)).await, Routed::Resolved));
        assert_eq!(rx.await.unwrap().data["id"], "p1");
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let pending = PendingRequests::new();
        let (a, _ra) = pending.register("produce", Duration::from_secs(5)).await;
        let (b, _rb) = pending.register("produce", Duration::from_secs(5)).await;
        assert_ne!(a, b);
        assert_eq!(pending.len().await, 2);
    }

    #[tokio::test]
    async fn expired_requests_discard_late_replies() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register("consume", Duration::from_secs(5)).await;
        pending.expire(&id).await;
        drop(rx);

        match pending.route(reply(&id)).await {
            Routed::Late { id: late } => assert_eq!(late, id),
            other => panic!("late reply routed as {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_past_the_deadline_are_not_delivered() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register("consume", Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(pending.route(reply(&id)).await, Routed::Late { .. }));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn frames_without_id_are_events() {
        let pending = PendingRequests::new();
        let event = Envelope::new("new-producer", json!({}), None);
        assert!(matches!(pending.route(event).await, Routed::Unsolicited(_)));
    }

    #[tokio::test]
    async fn fail_all_closes_waiting_callers() {
        let pending = PendingRequests::new();
        let (_id, rx) = pending.register("produce", Duration::from_secs(5)).await;
        pending.fail_all().await;
        assert!(rx.await.is_err());
    }
}
