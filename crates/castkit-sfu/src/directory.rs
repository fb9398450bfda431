//! Process-wide index of live producers and the `new-producer` fan-out.
//!
//! Callers hold the registry lock (read or write) while mutating the
//! directory, so fan-out targets and directory contents never disagree.

use crate::registry::SessionRegistry;
use castkit_common::protocol::{events, Envelope, NewProducer};
use castkit_common::{MediaKind, PeerId, ProducerId};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// Directory mutations, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    Added {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    Removed {
        producer_id: ProducerId,
        remaining: usize,
    },
}

#[derive(Debug, Default)]
pub struct ProducerDirectory {
    entries: BTreeMap<ProducerId, DirectoryEntry>,
    watcher: Option<mpsc::UnboundedSender<DirectoryChange>>,
}

impl ProducerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change is forwarded to `watcher` while the directory is still locked.
    pub fn with_watcher(watcher: mpsc::UnboundedSender<DirectoryChange>) -> Self {
        Self {
            entries: BTreeMap::new(),
            watcher: Some(watcher),
        }
    }

    fn notify(&self, change: DirectoryChange) {
        if let Some(watcher) = &self.watcher {
            if watcher.send(change).is_err() {
                tracing::warn!("Directory watcher is gone");
            }
        }
    }

    /// Inserts the producer and announces it to every peer except its owner.
    /// Returns how many peers were notified.
    pub fn add(
        &mut self,
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        registry: &SessionRegistry,
    ) -> usize {
        self.entries.insert(
            producer_id.clone(),
            DirectoryEntry {
                peer_id: peer_id.clone(),
                kind,
            },
        );
        self.notify(DirectoryChange::Added {
            producer_id: producer_id.clone(),
            peer_id: peer_id.clone(),
            kind,
        });

        let announcement = NewProducer {
            producer_id,
            peer_id,
            kind,
        };
        let envelope = match Envelope::event(events::NEW_PRODUCER, &announcement) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode new-producer");
                return 0;
            }
        };

        registry
            .sessions()
            .filter(|session| session.peer_id != announcement.peer_id)
            .filter(|session| session.outbound.try_push(envelope.clone()))
            .count()
    }

    /// Returns the number of producers left, or `None` if the id was unknown.
    pub fn remove(&mut self, producer_id: &ProducerId) -> Option<usize> {
        self.entries.remove(producer_id)?;
        let remaining = self.entries.len();
        self.notify(DirectoryChange::Removed {
            producer_id: producer_id.clone(),
            remaining,
        });
        Some(remaining)
    }

    pub fn get(&self, producer_id: &ProducerId) -> Option<&DirectoryEntry> {
        self.entries.get(producer_id)
    }

    pub fn contains(&self, producer_id: &ProducerId) -> bool {
        self.entries.contains_key(producer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn producer_ids(&self) -> impl Iterator<Item = &ProducerId> {
        self.entries.keys()
    }

    /// Backfill for a newly connected peer: everything it does not own.
    pub fn list_except(&self, peer_id: &PeerId) -> Vec<NewProducer> {
        self.entries
            .iter()
            .filter(|(_, entry)| &entry.peer_id != peer_id)
            .map(|(producer_id, entry)| NewProducer {
                producer_id: producer_id.clone(),
                peer_id: entry.peer_id.clone(),
                kind: entry.kind,
            })
            .collect()
    }
}
