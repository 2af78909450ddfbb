use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use viewra_playback::{
    config::Config,
    content::ContentStore,
    logging,
    planner::{FfprobeProber, PlaybackPlanner},
    provider::{HardwareProvider, PipelineProvider, ProviderManager},
    repository::SessionStore,
    service::{CleanupService, TranscodeManager},
    supervisor::ProcessSupervisor,
};

#[derive(Parser)]
#[command(name = "viewra", about = "Viewra playback & transcoding core")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "VIEWRA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration (load already validates)
    let config = Config::load(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Viewra transcoding core starting...");
    info!("Transcode root: {}", config.transcoding.root.display());

    // 3. Open the session database and run migrations
    tokio::fs::create_dir_all(&config.transcoding.root).await?;
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database_url())
        .await?;
    let store = SessionStore::new(pool);
    store.migrate().await?;
    info!("Session store ready");

    // 4. Build the core services
    let supervisor = Arc::new(ProcessSupervisor::new(std::time::Duration::from_secs(
        config.encoder.stop_grace_seconds,
    )));
    let content = ContentStore::new(config.transcoding.content_root());

    let providers = Arc::new(ProviderManager::new(store.clone()));
    providers.register(Arc::new(PipelineProvider::new(&config.encoder)))?;
    for accel in &config.encoder.hardware_accelerators {
        let provider = HardwareProvider::new(&config.encoder, accel);
        if provider.is_available() {
            info!("Registering hardware provider for {accel}");
        } else {
            warn!("Hardware accelerator {accel} not available, registering anyway");
        }
        providers.register(Arc::new(provider))?;
    }
    info!("Registered {} providers", providers.len());

    let planner = PlaybackPlanner::new(Arc::new(FfprobeProber::new(
        config.encoder.ffprobe_path.clone(),
    )))
    .with_hardware_preference(
        config.transcoding.prefer_hardware,
        (!config.transcoding.hardware_type.is_empty())
            .then(|| config.transcoding.hardware_type.clone()),
    );

    let manager = Arc::new(TranscodeManager::new(
        &config,
        store.clone(),
        content.clone(),
        providers,
        planner,
        supervisor.clone(),
    ));
    manager.init().await?;

    // 5. Start the cleanup loop
    let cleanup = Arc::new(CleanupService::new(
        config.cleanup.clone(),
        store,
        content,
        supervisor,
        config.transcoding.sessions_root(),
    ));
    let cleanup_task = cleanup.clone().start();
    info!("Cleanup loop started (interval {}s)", config.cleanup.interval_seconds);

    info!("Viewra transcoding core ready");

    // 6. Wait for a shutdown signal
    wait_for_shutdown().await;

    // 7. Graceful shutdown: stop admitting, cancel sessions, reap processes
    manager.shutdown().await;
    cleanup.stop();
    let _ = cleanup_task.await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
