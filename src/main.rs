// Draft coordinator entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Open database
// 4. Restore the session registry, dropping anything already expired
// 5. Spawn the dispatcher loop (commands + persistence + expiry sweep)
// 6. Hand the command channel to the presentation layer
// 7. Wait for Ctrl+C, then shut down and persist

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use draft_coordinator::app::{self, Engine, EngineHandle};
use draft_coordinator::config;
use draft_coordinator::db::Database;
use draft_coordinator::registry::SessionRegistry;
use draft_coordinator::rooms::NoopRooms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("Draft coordinator starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: capacity={}, ttl={}h, drafting service={}",
        config.registry.capacity, config.registry.session_ttl_hours, config.drafting.service_url
    );

    // 3. Open database
    let db = Database::open(&config.db_path).context("failed to open database")?;
    info!("Database opened at {}", config.db_path);

    // 4. Restore the registry
    let (registry, dropped) = SessionRegistry::load(&db, config.registry.capacity)
        .context("failed to restore session registry")?;
    info!(
        "Registry restored: {} live sessions, {} expired sessions dropped",
        registry.len(),
        dropped
    );

    // 5. Spawn the dispatcher loop. The room provider is a no-op here; a
    // deployment wires its chat backend in instead.
    let engine = Engine::new(
        registry,
        db,
        Arc::new(NoopRooms),
        config.session_ttl(),
        Some(config.drafting.clone()),
    );
    let (tx, rx) = mpsc::channel(64);
    let app_handle = tokio::spawn(app::run(
        rx,
        engine,
        Duration::from_secs(config.registry.persist_interval_secs),
        Duration::from_secs(config.registry.sweep_interval_secs),
    ));

    // 6. The presentation layer drives sessions through this handle.
    let handle = EngineHandle::new(tx);
    info!("Draft coordinator ready");

    // 7. Wait for Ctrl+C, then close the command channel so the loop
    // persists everything and exits.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    drop(handle);

    match tokio::time::timeout(Duration::from_secs(5), app_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Dispatcher error during shutdown: {e:#}"),
        Ok(Err(e)) => error!("Dispatcher task panicked: {e}"),
        Err(_) => error!("Dispatcher did not stop within 5s"),
    }

    info!("Draft coordinator shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file (not the terminal, which belongs to
/// whatever front end is attached).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("draft-coordinator.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("draft_coordinator=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
