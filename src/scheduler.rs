//! Periodic background pass that re-queues novels whose freshness window has
//! lapsed (or that never finished syncing).

use crate::db::NovelStore;
use crate::helpers::now_ts;
use crate::sync::{SyncEngine, SyncOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn run_scheduler(
    engine: Arc<SyncEngine>,
    store: Arc<dyn NovelStore>,
    options: SyncOptions,
    interval: Duration,
    cancel: CancellationToken,
) {
    log::info!("scheduler started, interval {:?}", interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let novels = match store.list_novels() {
            Ok(novels) => novels,
            Err(e) => {
                log::warn!("scheduler pass skipped: {}", e);
                continue;
            }
        };

        let now = now_ts();
        let mut queued = 0usize;
        for novel in novels {
            let window = if novel.done {
                options.fresh_done_secs
            } else {
                options.fresh_pending_secs
            };
            if now - novel.fetched_at >= window && engine.schedule_update(novel.nid) {
                queued += 1;
            }
        }
        if queued > 0 {
            log::info!("scheduler queued {} novel(s) for re-sync", queued);
        }
    }
}
