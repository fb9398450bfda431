//! External transcoder processes.
//!
//! The bridge only needs three things from a transcoder: start it for a job,
//! learn when it exits on its own, and stop it. [`FfmpegTranscoder`] does that
//! with a supervised child process.

use async_trait::async_trait;
use castkit_common::{CastError, CastResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

/// Everything a transcoder needs to start one egress generation.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub generation: u64,
    pub sdp_path: PathBuf,
    pub output_dir: PathBuf,
    pub args: Vec<String>,
}

#[async_trait]
pub trait Transcoder: Send + Sync + 'static {
    async fn spawn(&self, job: &TranscodeJob) -> CastResult<Box<dyn TranscoderProcess>>;
}

/// A running transcoder.
#[async_trait]
pub trait TranscoderProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolves when the process exits, with a description of how it ended.
    /// Must be cancel safe: the bridge polls it inside `select!`.
    async fn wait(&mut self) -> CastResult<String>;

    /// Graceful stop, forced after `timeout`.
    async fn stop(&mut self, timeout: Duration) -> CastResult<()>;
}

/// Runs an ffmpeg-compatible binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> CastResult<Box<dyn TranscoderProcess>> {
        tokio::fs::create_dir_all(&job.output_dir).await?;

        tracing::info!(
            program = %self.program,
            generation = job.generation,
            sdp = %job.sdp_path.display(),
            "Spawning transcoder"
        );

        let mut child = Command::new(&self.program)
            .args(&job.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CastError::Transcoder(format!("failed to start {}: {e}", self.program)))?;

        if let Some(stderr) = child.stderr.take() {
            let generation = job.generation;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(generation, "transcoder: {line}");
                }
            });
        }

        let stdin = child.stdin.take();
        Ok(Box::new(FfmpegProcess { child, stdin }))
    }
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl TranscoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> CastResult<String> {
        let status = self.child.wait().await?;
        Ok(status.to_string())
    }

    async fn stop(&mut self, timeout: Duration) -> CastResult<()> {
        // ffmpeg finishes the playlist and exits on `q`.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(%status, "Transcoder stopped");
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Transcoder did not stop, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
