//! auris-server - Audio Enhancement Batch Service
//!
//! Accepts batches of audio files, runs each through the fixed enhancement
//! pipeline on a bounded worker pool, and reports live progress to
//! observers over WebSocket, with reconnect-safe replay backed by the
//! persisted job store.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use auris_common::config::AurisConfig;
use auris_server::bus::ProgressBus;
use auris_server::manager::JobManager;
use auris_server::package::ZipPackager;
use auris_server::pipeline::denoise::ConfiguredDenoisers;
use auris_server::pipeline::transcode::FfmpegTranscoder;
use auris_server::store::JobStateStore;
use auris_server::AppState;

/// Broadcast capacity per job (per-observer buffer bound before lag)
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting auris-server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Resolve configuration: AURIS_CONFIG overrides the default file path
    let config_path = std::env::var("AURIS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("auris.toml"));
    let config = Arc::new(AurisConfig::load(Some(&config_path))?);

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.uploads_dir())?;
    std::fs::create_dir_all(config.outputs_dir())?;

    // Open or create the job database
    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = auris_server::db::init_database_pool(&db_path).await?;

    // Jobs left non-terminal by a previous process will never progress;
    // fail them now so listings and observers see the truth
    let recovered = auris_server::db::jobs::fail_stale_jobs(&pool).await?;
    if recovered > 0 {
        info!(jobs = recovered, "Failed stale jobs from previous run");
    }

    let store = Arc::new(JobStateStore::new(pool));
    let bus = Arc::new(ProgressBus::new(EVENT_CHANNEL_CAPACITY, config.replay_tail));

    // External collaborators
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
    ));
    let denoisers = Arc::new(ConfiguredDenoisers::new(
        config.denoiser_command.clone(),
        config.data_dir.join("denoiser"),
    ));

    let manager = JobManager::new(
        store,
        bus,
        transcoder,
        denoisers,
        Arc::new(ZipPackager),
        &config,
    );
    manager.spawn_workers();

    let state = AppState::new(manager, config.clone());
    let app = auris_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
