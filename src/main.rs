use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use edgecam::camera::CameraController;
use edgecam::config::AppConfig;
use edgecam::extract::ExtractionManager;
use edgecam::record::{RecorderManager, RotationPolicy};
use edgecam::state::AppState;
use edgecam::stream::StreamManager;
use edgecam::video::bus::FrameBus;
use edgecam::web;

/// edgecam command line arguments
#[derive(Parser, Debug)]
#[command(name = "edgecam")]
#[command(version, about = "Edge-device camera streaming and recording server", long_about = None)]
struct CliArgs {
    /// Path to the configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "edgecam.toml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.verbose);

    tracing::info!("Starting edgecam v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(address) = args.address {
        config.server.bind_address = address;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    config.storage.ensure_dirs()?;
    tracing::info!(
        "Storage: videos={} photos={} frames={}",
        config.storage.videos_dir.display(),
        config.storage.photos_dir.display(),
        config.storage.frames_dir.display()
    );

    // Compose the application: one bus, one controller, one recorder,
    // one extraction registry; no globals.
    let bus = FrameBus::new();
    let controller = CameraController::spawn(bus.clone());
    let stream_manager = StreamManager::new(config.server.max_stream_clients);
    let recorder = RecorderManager::new(
        &config.storage.videos_dir,
        RotationPolicy {
            max_duration_s: config.recorder.rotate_max_duration_s,
            max_size_bytes: config.recorder.rotate_max_bytes,
        },
    );
    let extraction = ExtractionManager::new(&config.storage.frames_dir, None);

    let (shutdown_tx, _) = broadcast::channel(1);
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))?;

    let state = AppState::new(
        config,
        bus,
        controller.clone(),
        stream_manager,
        recorder,
        extraction,
        shutdown_tx.clone(),
    );

    let router = web::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Leave the device in a clean state on the way out
    if state.controller.is_open() {
        if let Err(e) = state.controller.close().await {
            tracing::warn!("Shutdown close: {}", e);
        }
    }
    tracing::info!("edgecam stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "info,tower_http=warn",
        1 => "debug,tower_http=info",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
