use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::engine::{Engine, InMemoryStore, ReconcileReport};

/// Background task that reverts elapsed postponements. Runs once at start
/// so a restart never leaves stale moves in place, then every `every`. A
/// sweep with failures is retried after `retry` instead.
pub async fn run_sweep(engine: Arc<Engine>, every: Duration, retry: Duration) {
    loop {
        let report = sweep_once(&engine, today()).await;
        let wait = if report.is_clean() { every } else { retry };
        if !report.is_clean() {
            warn!("sweep left {} records unprocessed, retrying in {wait:?}", report.failed);
        }
        tokio::time::sleep(wait).await;
    }
}

pub async fn sweep_once(engine: &Engine, as_of: NaiveDate) -> ReconcileReport {
    let report = engine.reconcile(as_of).await;
    if report.reverted + report.repaired > 0 {
        info!(
            "sweep for {as_of}: reverted {}, repaired {}",
            report.reverted, report.repaired
        );
    }
    report
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<InMemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
