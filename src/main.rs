use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use timetable::engine::{Engine, InMemoryStore};
use timetable::notice::NoticeHub;
use timetable::sweep;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("TIMETABLE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    timetable::observability::init(metrics_port)?;

    let data_dir = std::env::var("TIMETABLE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let sweep_every = Duration::from_secs(env_or("TIMETABLE_SWEEP_INTERVAL_SECS", 86_400));
    let sweep_retry = Duration::from_secs(env_or("TIMETABLE_SWEEP_RETRY_SECS", 300));
    let compact_threshold: u64 = env_or("TIMETABLE_COMPACT_THRESHOLD", 1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("timetable.wal");
    let store = Arc::new(InMemoryStore::open(&wal_path)?);
    let notices = Arc::new(NoticeHub::new());
    let engine = Arc::new(Engine::with_store(store.clone(), notices));

    info!("timetable engine started");
    info!("  wal: {}", wal_path.display());
    info!("  bookings: {}", store.booking_count());
    info!("  sweep: every {sweep_every:?}, retry {sweep_retry:?}");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let sweeper = tokio::spawn(sweep::run_sweep(engine.clone(), sweep_every, sweep_retry));
    let compactor = tokio::spawn(sweep::run_compactor(store.clone(), compact_threshold));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();
    // Leave a compact log behind so the next start replays quickly.
    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("timetable stopped");
    Ok(())
}
