//! Hierarchical incremental sync: novel -> volumes -> chapters.
//!
//! A novel sync short-circuits entirely while the stored row is fresh (24 h
//! once fully synced, 1 h while incomplete). A volume always re-reads its
//! page and skips chapter work only when the stored row is confirmed done and
//! the source reports nothing newer. Volume failures are counted and reported
//! but never abort the novel; a chapter failure aborts its volume so the
//! volume is retried whole next time. A level is only marked `done` once
//! everything beneath it is confirmed synced.

use crate::config::SyncConfig;
use crate::db::{NovelStore, StoreError};
use crate::error::SyncError;
use crate::helpers::now_ts;
use crate::models::{ChapterRecord, NovelRecord, VolumeRecord, VolumeSummary};
use crate::source::NovelSource;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub fresh_done_secs: i64,
    pub fresh_pending_secs: i64,
    pub volume_delay_min_ms: u64,
    pub volume_delay_max_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fresh_done_secs: 86_400,
            fresh_pending_secs: 3600,
            volume_delay_min_ms: 1000,
            volume_delay_max_ms: 2000,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            fresh_done_secs: cfg.fresh_done_secs,
            fresh_pending_secs: cfg.fresh_pending_secs,
            volume_delay_min_ms: cfg.volume_delay_min_ms,
            volume_delay_max_ms: cfg.volume_delay_max_ms,
        }
    }
}

/// Per-novel snapshot of sync work, served by the status route. Entries are
/// keyed by novel id so concurrent syncs never clobber each other's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncProgress {
    pub nid: u32,
    pub in_progress: bool,
    pub volumes_total: usize,
    pub volumes_synced: usize,
    pub volumes_failed: usize,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

pub struct SyncEngine {
    source: Arc<dyn NovelSource>,
    store: Arc<dyn NovelStore>,
    options: SyncOptions,
    cancel: CancellationToken,
    progress: Mutex<HashMap<u32, SyncProgress>>,
    running: Mutex<HashSet<u32>>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn NovelSource>,
        store: Arc<dyn NovelStore>,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            options,
            cancel,
            progress: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn progress(&self) -> Vec<SyncProgress> {
        let mut all: Vec<SyncProgress> =
            self.progress.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|p| p.nid);
        all
    }

    pub fn novel_progress(&self, nid: u32) -> Option<SyncProgress> {
        self.progress.lock().unwrap().get(&nid).cloned()
    }

    /// Sync one novel and everything beneath it. Returns the stored row
    /// untouched (zero fetches, zero writes) while it is still fresh, unless
    /// `force` is set.
    pub async fn update_novel(&self, nid: u32, force: bool) -> Result<NovelRecord, SyncError> {
        let existing = self
            .store
            .get_novel(nid)
            .map_err(store_err("reading novel"))?;

        if !force {
            if let Some(novel) = &existing {
                let window = if novel.done {
                    self.options.fresh_done_secs
                } else {
                    self.options.fresh_pending_secs
                };
                if now_ts() - novel.fetched_at < window {
                    log::debug!("novel {} fresh, skipping sync", nid);
                    return Ok(novel.clone());
                }
            }
        }

        let page = self.source.novel(nid).await?;
        let mut record = page.to_record(now_ts());
        self.store
            .upsert_novel(&record)
            .map_err(store_err("writing novel"))?;

        self.progress.lock().unwrap().insert(
            nid,
            SyncProgress {
                nid,
                in_progress: true,
                volumes_total: page.volumes.len(),
                started_at: Some(now_ts()),
                ..Default::default()
            },
        );

        let mut failures = 0usize;
        let mut cancelled = false;
        for (i, summary) in page.volumes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("sync of novel {} cancelled before volume {}", nid, summary.vid);
                cancelled = true;
                break;
            }
            if i > 0 {
                tokio::time::sleep(self.volume_pause()).await;
            }
            match self
                .update_volume(nid, summary.vid, Some(summary), force)
                .await
            {
                Ok(_) => self.bump(nid, |p| p.volumes_synced += 1),
                Err(e) => {
                    log::warn!("volume {} of novel {} failed: {}", summary.vid, nid, e);
                    failures += 1;
                    self.bump(nid, |p| p.volumes_failed += 1);
                }
            }
        }

        if failures == 0 && !cancelled {
            self.store
                .mark_novel_done(nid, true)
                .map_err(store_err("marking novel done"))?;
            record.done = true;
        } else {
            log::info!(
                "novel {} left incomplete ({} of {} volumes failed)",
                nid,
                failures,
                page.volumes.len()
            );
        }

        self.bump(nid, |p| {
            p.in_progress = false;
            p.finished_at = Some(now_ts());
        });
        Ok(record)
    }

    /// Sync one volume and all of its chapters. The volume page is always
    /// re-read; chapter work is skipped only when the stored row is done and
    /// the source reports nothing newer. The first chapter failure aborts the
    /// volume, leaving it not-done so the whole volume is retried on the next
    /// pass.
    pub async fn update_volume(
        &self,
        nid: u32,
        vid: u32,
        summary: Option<&VolumeSummary>,
        force: bool,
    ) -> Result<VolumeRecord, SyncError> {
        // callers without a summary (read-through) resolve it off the parent
        // novel; a volume absent from the novel's current list is gone
        let resolved;
        let summary = match summary {
            Some(s) => s,
            None => {
                let novel = self.source.novel(nid).await?;
                resolved = novel
                    .volumes
                    .into_iter()
                    .find(|v| v.vid == vid)
                    .ok_or_else(|| SyncError::NotFound(format!("volume {}:{}", nid, vid)))?;
                &resolved
            }
        };

        let existing = self
            .store
            .get_volume(vid)
            .map_err(store_err("reading volume"))?;

        let page = self.source.volume(nid, vid).await?;

        if !force {
            if let Some(volume) = &existing {
                if volume.done && volume.updated_at >= page.updated_at {
                    log::debug!("volume {} unchanged upstream, skipping chapters", vid);
                    return Ok(volume.clone());
                }
            }
        }

        let mut record = VolumeRecord {
            vid,
            nid,
            name: summary.name.clone(),
            ordinal: summary.ordinal.clone(),
            description: page.description.clone(),
            cover: page.cover.clone(),
            labels: page.labels.clone(),
            updated_at: page.updated_at,
            fetched_at: now_ts(),
            done: false,
        };
        self.store
            .upsert_volume(&record)
            .map_err(store_err("writing volume"))?;

        for (index, chapter) in page.chapters.iter().enumerate() {
            let stored = self
                .store
                .get_chapter(chapter.cid)
                .map_err(store_err("reading chapter"))?;
            if let Some(stored) = stored {
                if stored.updated_at >= page.updated_at {
                    continue;
                }
            }
            let assembled = self.source.chapter(nid, chapter.cid).await?;
            self.store
                .upsert_chapter(&ChapterRecord {
                    cid: chapter.cid,
                    vid,
                    nid,
                    title: chapter.title.clone(),
                    content: assembled.content,
                    images: assembled.images,
                    index: index as u32,
                    // the source exposes no per-chapter timestamp
                    updated_at: page.updated_at,
                    fetched_at: now_ts(),
                })
                .map_err(store_err("writing chapter"))?;
        }

        self.store
            .mark_volume_done(vid, true)
            .map_err(store_err("marking volume done"))?;
        record.done = true;
        Ok(record)
    }

    /// Read-through chapter access: serve the stored row when present,
    /// otherwise sync the parent volume and read again.
    pub async fn get_chapter(
        &self,
        nid: u32,
        vid: u32,
        cid: u32,
    ) -> Result<ChapterRecord, SyncError> {
        if let Some(chapter) = self
            .store
            .get_chapter(cid)
            .map_err(store_err("reading chapter"))?
        {
            return Ok(chapter);
        }
        self.update_volume(nid, vid, None, false).await?;
        self.store
            .get_chapter(cid)
            .map_err(store_err("reading chapter"))?
            .ok_or_else(|| SyncError::NotFound(format!("chapter {}:{}", vid, cid)))
    }

    /// Queue a background sync for `nid` unless one is already queued or
    /// running. Returns whether a new sync was scheduled.
    pub fn schedule_update(self: &Arc<Self>, nid: u32) -> bool {
        {
            let mut running = self.running.lock().unwrap();
            if !running.insert(nid) {
                return false;
            }
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.update_novel(nid, false).await {
                log::warn!("background sync of novel {} failed: {}", nid, e);
            }
            engine.running.lock().unwrap().remove(&nid);
        });
        true
    }

    pub fn is_scheduled(&self, nid: u32) -> bool {
        self.running.lock().unwrap().contains(&nid)
    }

    fn bump(&self, nid: u32, f: impl FnOnce(&mut SyncProgress)) {
        if let Some(progress) = self.progress.lock().unwrap().get_mut(&nid) {
            f(progress);
        }
    }

    fn volume_pause(&self) -> Duration {
        let (min, max) = (
            self.options.volume_delay_min_ms,
            self.options.volume_delay_max_ms.max(self.options.volume_delay_min_ms),
        );
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

fn store_err(context: &'static str) -> impl FnOnce(StoreError) -> SyncError {
    move |e| SyncError::persistence(context, e)
}
