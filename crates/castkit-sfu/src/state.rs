//! Shared relay state.
//!
//! Lock order is always registry, then directory. No engine call is awaited
//! while either lock is held.

use crate::directory::ProducerDirectory;
use crate::egress::EgressHandle;
use crate::registry::SessionRegistry;
use castkit_common::config::SignalingConfig;
use castkit_media::SharedEngine;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub struct SfuState {
    pub engine: SharedEngine,
    pub registry: RwLock<SessionRegistry>,
    pub directory: RwLock<ProducerDirectory>,
    pub config: SignalingConfig,
    /// `None` when egress is disabled.
    pub egress: Option<EgressHandle>,
    started_at: Instant,
}

impl SfuState {
    pub fn new(engine: SharedEngine, config: SignalingConfig, egress: Option<EgressHandle>) -> Arc<Self> {
        let directory = match &egress {
            Some(handle) => ProducerDirectory::with_watcher(handle.directory_sender()),
            None => ProducerDirectory::new(),
        };
        Arc::new(Self {
            engine,
            registry: RwLock::new(SessionRegistry::new()),
            directory: RwLock::new(directory),
            config,
            egress,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Directory keys equal the union of every peer's producers.
    pub async fn is_consistent(&self) -> bool {
        let registry = self.registry.read().await;
        let directory = self.directory.read().await;
        let owned = registry.producer_ids();
        owned.len() == directory.len() && directory.producer_ids().all(|id| owned.contains(id))
    }
}
