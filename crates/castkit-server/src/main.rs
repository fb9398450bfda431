//! # castkit
//!
//! Relay binary. One listener serves:
//! - the signaling WebSocket (`/ws`)
//! - liveness (`/health`) and egress status (`/egress`)
//!
//! The media engine and the egress bridge run in the same process. The only
//! engine built in is the simulated [`LocalEngine`], which forwards no media,
//! so the binary refuses to start unless `--simulated-engine` is given.

use castkit_common::config::MediaConfig;
use castkit_media::{LocalEngine, SharedEngine};
use castkit_sfu::{build_router, signaling, EgressHandle, FfmpegTranscoder, SfuState};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "castkit", version, about = "WebRTC relay with HLS egress")]
struct Args {
    /// Config file path without extension (env vars still take precedence).
    #[arg(long, env = "CASTKIT_CONFIG", default_value = "castkit")]
    config: String,

    /// Disable the HLS egress bridge regardless of configuration.
    #[arg(long)]
    no_egress: bool,

    /// Run on the in-process simulated engine. Signaling works end to end
    /// but no RTP is received or forwarded.
    #[arg(long, env = "CASTKIT_SIMULATED_ENGINE")]
    simulated_engine: bool,
}

/// Picks the media engine for this run.
fn select_engine(args: &Args, media: &MediaConfig) -> anyhow::Result<Arc<LocalEngine>> {
    if !args.simulated_engine {
        anyhow::bail!(
            "no packet-forwarding media engine is built in; \
             pass --simulated-engine (or set CASTKIT_SIMULATED_ENGINE=true) to run on the simulated engine"
        );
    }
    Ok(Arc::new(LocalEngine::new(media)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = castkit_common::config::load(&args.config)?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "castkit=debug,tower_http=debug".into());
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting castkit v{}", env!("CARGO_PKG_VERSION"));

    // === Media engine ===
    let engine = select_engine(&args, &config.media)?;
    let shared: SharedEngine = engine.clone();
    tracing::warn!(
        listen_ip = %config.media.listen_ip,
        ports = %format!("{}-{}", config.media.rtc_min_port, config.media.rtc_max_port),
        "Simulated media engine ready, no media will be forwarded"
    );

    // === Egress bridge ===
    let egress = if config.egress.enabled && !args.no_egress {
        let transcoder = Arc::new(FfmpegTranscoder::new(config.egress.transcoder_path.clone()));
        tracing::info!(
            output_dir = %config.egress.output_dir,
            playlist = %config.egress.playlist,
            "HLS egress enabled"
        );
        Some(EgressHandle::spawn(shared.clone(), config.egress.clone(), transcoder))
    } else {
        tracing::info!("HLS egress disabled");
        None
    };

    // === Signaling ===
    let state = SfuState::new(shared, config.signaling.clone(), egress.clone());
    let listener_task = signaling::spawn_engine_listener(state.clone());

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Signaling listening on ws://{addr}/ws");

    let mut liveness = castkit_media::MediaEngine::liveness(engine.as_ref());
    let result = tokio::select! {
        served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).into_future() => {
            served.map_err(anyhow::Error::from)
        }
        // The relay cannot do anything useful without its engine.
        _ = liveness.wait_for(|alive| !*alive) => {
            tracing::error!("Media engine died, shutting down");
            Err(anyhow::anyhow!("media engine died"))
        }
    };

    if let Some(egress) = egress {
        egress.shutdown().await;
    }
    engine.shutdown();
    listener_task.abort();

    tracing::info!("castkit stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
