//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > castkit.toml > defaults

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};
use serde::Deserialize;

/// Load the configuration from defaults, an optional config file and the environment.
///
/// `file` is a path without extension (`castkit` reads `castkit.toml`,
/// `castkit.yaml`, ...). A missing file is not an error.
pub fn load(file: &str) -> Result<AppConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    with_defaults()?
        .add_source(config::File::with_name(file).required(false))
        // Environment variables (CASTKIT__SERVER__PORT, CASTKIT__EGRESS__ENABLED, etc.)
        .add_source(
            config::Environment::with_prefix("CASTKIT")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// Built-in defaults only. Used by tests and embedders.
pub fn defaults() -> Result<AppConfig, ConfigError> {
    with_defaults()?.build()?.try_deserialize()
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 3000)?
        .set_default("media.listen_ip", "127.0.0.1")?
        .set_default("media.rtc_min_port", 40000)?
        .set_default("media.rtc_max_port", 49999)?
        .set_default("signaling.outbound_queue_capacity", 256)?
        .set_default("signaling.request_timeout_ms", 10_000)?
        .set_default("egress.enabled", true)?
        .set_default("egress.rendezvous_ip", "127.0.0.1")?
        .set_default("egress.video_rtp_port", 5004)?
        .set_default("egress.video_rtcp_port", 5005)?
        .set_default("egress.audio_rtp_port", 5006)?
        .set_default("egress.audio_rtcp_port", 5007)?
        .set_default("egress.transcoder_path", "ffmpeg")?
        .set_default("egress.sdp_path", "./hls/egress.sdp")?
        .set_default("egress.output_dir", "./hls")?
        .set_default("egress.playlist", "stream.m3u8")?
        .set_default("egress.video_encoder", "libx264")?
        .set_default("egress.audio_encoder", "aac")?
        .set_default("egress.segment_secs", 2)?
        .set_default("egress.list_size", 5)?
        .set_default("egress.max_restarts", 3)?
        .set_default("egress.stop_timeout_ms", 5_000)?
        .set_default("log.json", false)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub egress: EgressConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Serves both the signaling WebSocket (`/ws`) and `/health`.
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Local address RTC transports bind to.
    pub listen_ip: String,
    /// Address advertised in ICE candidates when the relay sits behind NAT.
    #[serde(default)]
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Per-peer outbound queue depth. A peer that lets it fill up is disconnected.
    pub outbound_queue_capacity: usize,
    /// How long a client waits for a reply before failing the request locally.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EgressConfig {
    pub enabled: bool,
    /// Where the transcoder listens for the rendezvous RTP flows.
    pub rendezvous_ip: String,
    pub video_rtp_port: u16,
    pub video_rtcp_port: u16,
    pub audio_rtp_port: u16,
    pub audio_rtcp_port: u16,
    pub transcoder_path: String,
    pub sdp_path: String,
    pub output_dir: String,
    pub playlist: String,
    pub video_encoder: String,
    pub audio_encoder: String,
    /// HLS target segment duration.
    pub segment_secs: u32,
    /// Segments kept in the playlist before rotation deletes them.
    pub list_size: u32,
    /// Consecutive re-provisions allowed after transcoder crashes.
    pub max_restarts: u32,
    /// Grace period before the transcoder is force-killed on teardown.
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}
