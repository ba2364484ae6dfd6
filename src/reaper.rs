use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::now_ms;
use crate::model::Ms;
use crate::scheduler::Scheduler;
use crate::wal::WalJournal;

/// Release assignments that ended more than `retention` before `now`.
pub async fn reap_once(scheduler: &Scheduler, retention: Ms, now: Ms) -> usize {
    let pruned = scheduler.prune_history(now - retention).await;
    if pruned > 0 {
        info!("pruned {pruned} historical assignment(s)");
    }
    pruned
}

/// Background task that periodically drops old assignment history.
pub async fn run_reaper(scheduler: Arc<Scheduler>, retention: Ms, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&scheduler, retention, now_ms()).await;
    }
}

/// Compact when at least `threshold` records went in since the last compaction.
/// Returns the record count of the new journal, if it was rewritten.
pub async fn compact_if_needed(
    journal: &WalJournal,
    scheduler: &Scheduler,
    threshold: u64,
) -> io::Result<Option<usize>> {
    if journal.appends_since_compact().await? < threshold {
        return Ok(None);
    }
    journal.compact_from(scheduler).await.map(Some)
}

/// Background task that keeps the journal from growing without bound.
pub async fn run_compactor(
    journal: WalJournal,
    scheduler: Arc<Scheduler>,
    threshold: u64,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&journal, &scheduler, threshold).await {
            tracing::error!("compaction failed: {e}");
        }
    }
}
