//! Egress bridge: live producers → rendezvous transports → transcoder → HLS.
//!
//! ```text
//!   Producer ──▶ consumer ──▶ video rendezvous ──┐
//!   Producer ──▶ consumer ──▶ audio rendezvous ──┴──▶ transcoder ──▶ stream.m3u8
//! ```
//!
//! A single actor task owns the whole egress session. It mirrors the producer
//! directory from the change feed and drives the pipeline off the producer
//! count: the first producer provisions, every later one is piped in once, and
//! the last one leaving tears everything down. A transcoder that dies while
//! active is replaced by a fresh generation, up to `max_restarts` in a row.

pub mod sdp;
pub mod transcoder;

pub use transcoder::{FfmpegTranscoder, TranscodeJob, Transcoder, TranscoderProcess};

use crate::directory::DirectoryChange;
use castkit_common::config::EgressConfig;
use castkit_common::media::{RtpCapabilities, RtpCodecCapability};
use castkit_common::{CastError, CastResult, MediaKind, ProducerId, TransportId};
use castkit_media::{ConnectParams, ConsumeOptions, SharedEngine, TransportInfo, TransportKind, TransportOptions};
use sdp::RendezvousCodecs;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressState {
    Idle,
    Provisioning,
    Active,
    /// Provisioning failed or the restart budget ran out. Cleared when the
    /// producer count drops back to zero.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EgressStatus {
    pub state: EgressState,
    pub generation: u64,
    pub producers: usize,
    pub piped_producer_ids: Vec<ProducerId>,
    pub transcoder_pid: Option<u32>,
    pub provisions: u64,
    pub teardowns: u64,
    pub restarts: u32,
}

enum EgressCommand {
    Status(oneshot::Sender<EgressStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the egress actor.
#[derive(Clone)]
pub struct EgressHandle {
    commands: mpsc::Sender<EgressCommand>,
    changes: mpsc::UnboundedSender<DirectoryChange>,
}

impl EgressHandle {
    /// Spawns the actor. Feed it by passing [`Self::directory_sender`] to the directory.
    pub fn spawn(engine: SharedEngine, config: EgressConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (change_tx, change_rx) = mpsc::unbounded_channel();

        let bridge = EgressBridge {
            engine,
            config,
            transcoder,
            producers: BTreeMap::new(),
            session: None,
            state: EgressState::Idle,
            generation: 0,
            provisions: 0,
            teardowns: 0,
            restarts: 0,
        };
        tokio::spawn(bridge.run(cmd_rx, change_rx));

        Self {
            commands: cmd_tx,
            changes: change_tx,
        }
    }

    pub fn directory_sender(&self) -> mpsc::UnboundedSender<DirectoryChange> {
        self.changes.clone()
    }

    /// Snapshot taken after every change queued before this call was applied.
    pub async fn status(&self) -> CastResult<EgressStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(EgressCommand::Status(reply_tx))
            .await
            .map_err(|_| CastError::Internal(anyhow::anyhow!("egress bridge is not running")))?;
        reply_rx
            .await
            .map_err(|_| CastError::Internal(anyhow::anyhow!("egress bridge dropped the status request")))
    }

    /// Tears down any active session and stops the actor.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(EgressCommand::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct EgressSession {
    generation: u64,
    video: TransportInfo,
    audio: TransportInfo,
    /// What the rendezvous side accepts; also what the SDP announces.
    capabilities: RtpCapabilities,
    piped: BTreeSet<ProducerId>,
    process: Box<dyn TranscoderProcess>,
}

struct EgressBridge {
    engine: SharedEngine,
    config: EgressConfig,
    transcoder: Arc<dyn Transcoder>,
    producers: BTreeMap<ProducerId, MediaKind>,
    session: Option<EgressSession>,
    state: EgressState,
    generation: u64,
    provisions: u64,
    teardowns: u64,
    restarts: u32,
}

/// Pending forever while no session exists.
async fn wait_for_exit(session: &mut Option<EgressSession>) -> (u64, CastResult<String>) {
    match session {
        Some(session) => (session.generation, session.process.wait().await),
        None => std::future::pending().await,
    }
}

impl EgressBridge {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EgressCommand>,
        mut changes: mpsc::UnboundedReceiver<DirectoryChange>,
    ) {
        tracing::info!("Egress bridge started");

        loop {
            tokio::select! {
                biased;

                change = changes.recv() => match change {
                    Some(change) => self.on_change(change).await,
                    None => break,
                },

                command = commands.recv() => match command {
                    Some(EgressCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(EgressCommand::Shutdown(done)) => {
                        self.teardown(true).await;
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                },

                (generation, exit) = wait_for_exit(&mut self.session) => {
                    self.on_transcoder_exit(generation, exit).await;
                }
            }
        }

        self.teardown(true).await;
        tracing::info!("Egress bridge stopped");
    }

    fn status(&self) -> EgressStatus {
        EgressStatus {
            state: self.state,
            generation: self.generation,
            producers: self.producers.len(),
            piped_producer_ids: self
                .session
                .as_ref()
                .map(|s| s.piped.iter().cloned().collect())
                .unwrap_or_default(),
            transcoder_pid: self.session.as_ref().and_then(|s| s.process.pid()),
            provisions: self.provisions,
            teardowns: self.teardowns,
            restarts: self.restarts,
        }
    }

    async fn on_change(&mut self, change: DirectoryChange) {
        match change {
            DirectoryChange::Added {
                producer_id, kind, ..
            } => {
                self.producers.insert(producer_id.clone(), kind);
                match self.state {
                    EgressState::Idle => self.provision().await,
                    EgressState::Active => self.pipe(&producer_id, kind).await,
                    EgressState::Provisioning | EgressState::Failed => {}
                }
            }
            DirectoryChange::Removed {
                producer_id,
                remaining,
            } => {
                self.producers.remove(&producer_id);
                if let Some(session) = self.session.as_mut() {
                    session.piped.remove(&producer_id);
                }
                if self.producers.is_empty() {
                    tracing::debug!(remaining, "Last producer left");
                    self.teardown(true).await;
                    self.state = EgressState::Idle;
                    self.restarts = 0;
                }
            }
        }
    }

    async fn provision(&mut self) {
        self.state = EgressState::Provisioning;
        self.generation += 1;
        let generation = self.generation;
        tracing::info!(generation, producers = self.producers.len(), "Provisioning egress");

        match self.open_session(generation).await {
            Ok(session) => {
                tracing::info!(
                    generation,
                    video = %session.video.id,
                    audio = %session.audio.id,
                    pid = ?session.process.pid(),
                    "Egress active"
                );
                self.session = Some(session);
                self.state = EgressState::Active;
                self.provisions += 1;

                let known: Vec<_> = self.producers.iter().map(|(id, kind)| (id.clone(), *kind)).collect();
                for (producer_id, kind) in known {
                    self.pipe(&producer_id, kind).await;
                }
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "Egress provisioning failed");
                self.state = EgressState::Failed;
            }
        }
    }

    async fn open_session(&self, generation: u64) -> CastResult<EgressSession> {
        let router = self.engine.rtp_capabilities();
        let video_codecs = rendezvous_codecs(&router, MediaKind::Video)?;
        let audio_codecs = rendezvous_codecs(&router, MediaKind::Audio)?;

        let video = self
            .open_rendezvous(self.config.video_rtp_port, self.config.video_rtcp_port)
            .await?;
        let audio = match self
            .open_rendezvous(self.config.audio_rtp_port, self.config.audio_rtcp_port)
            .await
        {
            Ok(audio) => audio,
            Err(e) => {
                self.close_transports(&[&video.id]).await;
                return Err(e);
            }
        };

        let description = sdp::session_description(
            &self.config.rendezvous_ip,
            &RendezvousCodecs {
                codecs: &video_codecs,
                rtp_port: self.config.video_rtp_port,
                rtcp_port: self.config.video_rtcp_port,
            },
            &RendezvousCodecs {
                codecs: &audio_codecs,
                rtp_port: self.config.audio_rtp_port,
                rtcp_port: self.config.audio_rtcp_port,
            },
        );

        let job = TranscodeJob {
            generation,
            sdp_path: PathBuf::from(&self.config.sdp_path),
            output_dir: PathBuf::from(&self.config.output_dir),
            args: sdp::ffmpeg_args(&self.config),
        };

        let spawned = match write_description(&job.sdp_path, &description).await {
            Ok(()) => self.transcoder.spawn(&job).await,
            Err(e) => Err(e),
        };
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                self.close_transports(&[&video.id, &audio.id]).await;
                return Err(e);
            }
        };

        Ok(EgressSession {
            generation,
            video,
            audio,
            capabilities: RtpCapabilities {
                codecs: video_codecs.into_iter().chain(audio_codecs).collect(),
                header_extensions: Vec::new(),
            },
            piped: BTreeSet::new(),
            process,
        })
    }

    /// Plain transport with separate RTCP, connected to the transcoder's listen address.
    async fn open_rendezvous(&self, rtp_port: u16, rtcp_port: u16) -> CastResult<TransportInfo> {
        let transport = self
            .engine
            .create_transport(
                TransportKind::Plain,
                TransportOptions {
                    listen_ip: Some(self.config.rendezvous_ip.clone()),
                    rtcp_mux: false,
                },
            )
            .await?;

        let connected = self
            .engine
            .connect_transport(
                &transport.id,
                ConnectParams::Plain {
                    ip: self.config.rendezvous_ip.clone(),
                    port: rtp_port,
                    rtcp_port: Some(rtcp_port),
                },
            )
            .await;
        if let Err(e) = connected {
            self.close_transports(&[&transport.id]).await;
            return Err(e);
        }
        Ok(transport)
    }

    /// Pipes one producer into its kind's rendezvous transport, at most once per session.
    async fn pipe(&mut self, producer_id: &ProducerId, kind: MediaKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.piped.contains(producer_id) {
            return;
        }
        let transport_id = match kind {
            MediaKind::Video => session.video.id.clone(),
            MediaKind::Audio => session.audio.id.clone(),
        };

        let consumed = self
            .engine
            .consume(
                &transport_id,
                ConsumeOptions {
                    producer_id: producer_id.clone(),
                    rtp_capabilities: session.capabilities.clone(),
                    paused: false,
                },
            )
            .await;

        match consumed {
            Ok(consumer) => {
                session.piped.insert(producer_id.clone());
                tracing::info!(
                    generation = session.generation,
                    producer = %producer_id,
                    consumer = %consumer.id,
                    %kind,
                    "Producer piped into egress"
                );
            }
            Err(e) => {
                tracing::warn!(producer = %producer_id, %kind, error = %e, "Producer cannot be piped into egress");
            }
        }
    }

    async fn teardown(&mut self, stop_transcoder: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if stop_transcoder {
            let timeout = Duration::from_millis(self.config.stop_timeout_ms);
            if let Err(e) = session.process.stop(timeout).await {
                tracing::warn!(generation = session.generation, error = %e, "Transcoder stop failed");
            }
        }
        self.close_transports(&[&session.video.id, &session.audio.id]).await;

        self.teardowns += 1;
        self.state = EgressState::Idle;
        tracing::info!(
            generation = session.generation,
            piped = session.piped.len(),
            "Egress torn down"
        );
    }

    async fn on_transcoder_exit(&mut self, generation: u64, exit: CastResult<String>) {
        if self.session.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        match &exit {
            Ok(status) => tracing::warn!(generation, %status, "Transcoder exited unexpectedly"),
            Err(e) => tracing::error!(generation, error = %e, "Transcoder wait failed"),
        }

        self.teardown(false).await;
        if self.producers.is_empty() {
            return;
        }

        if self.restarts < self.config.max_restarts {
            self.restarts += 1;
            tracing::info!(attempt = self.restarts, max = self.config.max_restarts, "Restarting egress");
            self.provision().await;
        } else {
            tracing::error!(max = self.config.max_restarts, "Transcoder restart limit reached, egress disabled");
            self.state = EgressState::Failed;
        }
    }

    async fn close_transports(&self, transport_ids: &[&TransportId]) {
        for transport_id in transport_ids {
            if let Err(e) = self.engine.close_transport(transport_id).await {
                tracing::debug!(transport = %transport_id, error = %e, "Rendezvous close failed");
            }
        }
    }
}

/// Every router codec of a kind, so any producer the router accepts can be piped.
fn rendezvous_codecs(router: &RtpCapabilities, kind: MediaKind) -> CastResult<Vec<RtpCodecCapability>> {
    let codecs: Vec<_> = router
        .codecs
        .iter()
        .filter(|c| c.kind == kind && !c.codec_name().eq_ignore_ascii_case("rtx"))
        .cloned()
        .collect();
    if codecs.is_empty() {
        return Err(CastError::CapabilityMismatch(format!("router has no {kind} codec for egress")));
    }
    Ok(codecs)
}

async fn write_description(path: &std::path::Path, description: &str) -> CastResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, description).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use castkit_common::config::MediaConfig;
    use castkit_common::media::{RtpCodecParameters, RtpParameters, TransportDirection};
    use castkit_media::{LocalEngine, MediaEngine};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Stands in for ffmpeg. `crash(generation)` makes that generation exit.
    struct FakeTranscoder {
        spawned: AtomicUsize,
        stopped: Arc<AtomicUsize>,
        crash_tx: watch::Sender<u64>,
        jobs: Mutex<Vec<TranscodeJob>>,
    }

    impl FakeTranscoder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawned: AtomicUsize::new(0),
                stopped: Arc::new(AtomicUsize::new(0)),
                crash_tx: watch::channel(0).0,
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn crash(&self, generation: u64) {
            self.crash_tx.send_replace(generation);
        }
    }

    struct FakeProcess {
        generation: u64,
        crash_rx: watch::Receiver<u64>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn spawn(&self, job: &TranscodeJob) -> CastResult<Box<dyn TranscoderProcess>> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.jobs.lock().unwrap().push(job.clone());
            Ok(Box::new(FakeProcess {
                generation: job.generation,
                crash_rx: self.crash_tx.subscribe(),
                stopped: self.stopped.clone(),
            }))
        }
    }

    #[async_trait]
    impl TranscoderProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> CastResult<String> {
            loop {
                if *self.crash_rx.borrow_and_update() == self.generation {
                    return Ok("signal: 9 (SIGKILL)".into());
                }
                if self.crash_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn stop(&mut self, _timeout: Duration) -> CastResult<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        engine: Arc<LocalEngine>,
        transcoder: Arc<FakeTranscoder>,
        egress: EgressHandle,
        send_transport: TransportId,
        dir: PathBuf,
    }

    impl Fixture {
        async fn new(max_restarts: u32) -> Self {
            let engine = Arc::new(
                LocalEngine::new(&MediaConfig {
                    listen_ip: "127.0.0.1".into(),
                    announced_ip: None,
                    rtc_min_port: 41000,
                    rtc_max_port: 41100,
                })
                .unwrap(),
            );
            let dir = std::env::temp_dir().join(format!("castkit-egress-{}", uuid::Uuid::new_v4()));
            let mut config = castkit_common::config::defaults().unwrap().egress;
            config.sdp_path = dir.join("egress.sdp").to_string_lossy().into_owned();
            config.output_dir = dir.to_string_lossy().into_owned();
            config.max_restarts = max_restarts;

            let transcoder = FakeTranscoder::new();
            let egress = EgressHandle::spawn(engine.clone(), config, transcoder.clone());
            let send_transport = engine
                .create_transport(TransportKind::WebRtc(TransportDirection::Send), TransportOptions::default())
                .await
                .unwrap()
                .id;
            Self {
                engine,
                transcoder,
                egress,
                send_transport,
                dir,
            }
        }

        async fn add(&self, kind: MediaKind) -> ProducerId {
            let (mime, clock_rate, channels) = match kind {
                MediaKind::Video => ("video/VP8", 90_000, None),
                MediaKind::Audio => ("audio/opus", 48_000, Some(2)),
            };
            self.add_codec(kind, mime, clock_rate, channels).await
        }

        async fn add_codec(&self, kind: MediaKind, mime: &str, clock_rate: u32, channels: Option<u8>) -> ProducerId {
            let params = RtpParameters {
                codecs: vec![RtpCodecParameters {
                    mime_type: mime.into(),
                    payload_type: 111,
                    clock_rate,
                    channels,
                    parameters: Default::default(),
                    rtcp_feedback: Vec::new(),
                }],
                ..Default::default()
            };
            let producer = self
                .engine
                .produce(&self.send_transport, kind, params, serde_json::Value::Null)
                .await
                .unwrap();
            self.egress
                .directory_sender()
                .send(DirectoryChange::Added {
                    producer_id: producer.id.clone(),
                    peer_id: "alice".into(),
                    kind,
                })
                .unwrap();
            producer.id
        }

        fn remove(&self, producer_id: &ProducerId, remaining: usize) {
            self.egress
                .directory_sender()
                .send(DirectoryChange::Removed {
                    producer_id: producer_id.clone(),
                    remaining,
                })
                .unwrap();
        }

        async fn status(&self) -> EgressStatus {
            self.egress.status().await.unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn first_producer_provisions_once() {
        let fx = Fixture::new(3).await;
        let video = fx.add(MediaKind::Video).await;
        let audio = fx.add(MediaKind::Audio).await;

        let status = fx.status().await;
        assert_eq!(status.state, EgressState::Active);
        assert_eq!(status.provisions, 1);
        assert_eq!(fx.transcoder.spawned.load(Ordering::SeqCst), 1);
        let mut expected = vec![video, audio];
        expected.sort();
        assert_eq!(status.piped_producer_ids, expected);

        let sdp = std::fs::read_to_string(fx.dir.join("egress.sdp")).unwrap();
        assert!(sdp.contains("m=video 5004"));
        assert!(sdp.contains("m=audio 5006"));
    }

    #[tokio::test]
    async fn duplicate_additions_are_piped_once() {
        let fx = Fixture::new(3).await;
        let video = fx.add(MediaKind::Video).await;
        fx.egress
            .directory_sender()
            .send(DirectoryChange::Added {
                producer_id: video.clone(),
                peer_id: "alice".into(),
                kind: MediaKind::Video,
            })
            .unwrap();

        let status = fx.status().await;
        assert_eq!(status.piped_producer_ids, vec![video]);
        // Two rendezvous transports, one egress consumer, plus the send transport.
        let counts = fx.engine.counts().await;
        assert_eq!(counts.transports, 3);
        assert_eq!(counts.consumers, 1);
    }

    #[tokio::test]
    async fn last_producer_leaving_tears_down_once() {
        let fx = Fixture::new(3).await;
        let a = fx.add(MediaKind::Video).await;
        let b = fx.add(MediaKind::Audio).await;
        fx.remove(&a, 1);
        assert_eq!(fx.status().await.teardowns, 0);
        fx.remove(&b, 0);

        let status = fx.status().await;
        assert_eq!(status.state, EgressState::Idle);
        assert_eq!(status.teardowns, 1);
        assert!(status.piped_producer_ids.is_empty());
        assert_eq!(fx.transcoder.stopped.load(Ordering::SeqCst), 1);
        // Only the publisher's own transport survives.
        assert_eq!(fx.engine.counts().await.transports, 1);
    }

    #[tokio::test]
    async fn re_entry_provisions_a_fresh_transcoder() {
        let fx = Fixture::new(3).await;
        let a = fx.add(MediaKind::Video).await;
        fx.remove(&a, 0);
        fx.add(MediaKind::Video).await;

        let status = fx.status().await;
        assert_eq!(status.state, EgressState::Active);
        assert_eq!(status.provisions, 2);
        assert_eq!(status.generation, 2);
        assert_eq!(fx.transcoder.spawned.load(Ordering::SeqCst), 2);
        let jobs = fx.transcoder.jobs.lock().unwrap();
        assert_eq!(jobs[1].generation, 2);
    }

    #[tokio::test]
    async fn crashed_transcoder_is_replaced_until_budget_runs_out() {
        let fx = Fixture::new(1).await;
        let video = fx.add(MediaKind::Video).await;
        assert_eq!(fx.status().await.generation, 1);

        fx.transcoder.crash(1);
        let mut status = fx.status().await;
        for _ in 0..50 {
            if status.generation == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = fx.status().await;
        }
        assert_eq!(status.state, EgressState::Active);
        assert_eq!(status.restarts, 1);
        assert_eq!(status.piped_producer_ids, vec![video.clone()]);

        fx.transcoder.crash(2);
        for _ in 0..50 {
            status = fx.status().await;
            if status.state == EgressState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status.state, EgressState::Failed);
        assert_eq!(fx.transcoder.spawned.load(Ordering::SeqCst), 2);

        // Back to zero clears the failure; the next producer provisions again.
        fx.remove(&video, 0);
        fx.add(MediaKind::Video).await;
        let status = fx.status().await;
        assert_eq!(status.state, EgressState::Active);
        assert_eq!(status.restarts, 0);
        assert_eq!(fx.transcoder.spawned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_the_transcoder() {
        let fx = Fixture::new(3).await;
        fx.add(MediaKind::Video).await;
        fx.egress.shutdown().await;
        assert_eq!(fx.transcoder.stopped.load(Ordering::SeqCst), 1);
        assert!(fx.egress.status().await.is_err());
    }

    #[tokio::test]
    async fn producers_of_any_router_codec_are_piped() {
        let fx = Fixture::new(3).await;
        let vp8 = fx.add(MediaKind::Video).await;
        let h264 = fx.add_codec(MediaKind::Video, "video/H264", 90_000, None).await;

        let status = fx.status().await;
        let mut expected = vec![vp8, h264];
        expected.sort();
        assert_eq!(status.piped_producer_ids, expected);
        assert_eq!(fx.engine.counts().await.consumers, 2);

        let sdp = std::fs::read_to_string(fx.dir.join("egress.sdp")).unwrap();
        assert!(sdp.contains("m=video 5004 RTP/AVP 101 102\n"));
        assert!(sdp.contains("a=rtpmap:102 H264/90000\n"));
    }

    #[test]
    fn rendezvous_carries_every_codec_of_the_kind() {
        let caps = RtpCapabilities {
            codecs: castkit_media::local::default_media_codecs(),
            header_extensions: Vec::new(),
        };
        let video: Vec<_> = rendezvous_codecs(&caps, MediaKind::Video)
            .unwrap()
            .into_iter()
            .map(|c| c.mime_type)
            .collect();
        assert_eq!(video, ["video/VP8", "video/H264"]);

        let audio_only = RtpCapabilities {
            codecs: rendezvous_codecs(&caps, MediaKind::Audio).unwrap(),
            header_extensions: Vec::new(),
        };
        let err = rendezvous_codecs(&audio_only, MediaKind::Video).unwrap_err();
        assert_eq!(err.error_code(), "CAPABILITY_MISMATCH");
    }

    #[test]
    fn transcoder_processes_can_be_shared_across_threads() {
        fn require_send_sync<T: Send + Sync + ?Sized>() {}
        require_send_sync::<dyn TranscoderProcess>();
        require_send_sync::<EgressBridge>();
    }
}
