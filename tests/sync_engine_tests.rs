/// Sync engine tests against scripted source and store mocks. No browser or
/// network involved; delays are zeroed so the suite runs fast.
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use wenku_rss::db::{NovelStore, StoreError};
use wenku_rss::error::SyncError;
use wenku_rss::helpers::now_ts;
use wenku_rss::models::*;
use wenku_rss::source::NovelSource;
use wenku_rss::sync::{SyncEngine, SyncOptions};

#[derive(Default)]
struct MemStore {
    novels: Mutex<HashMap<u32, NovelRecord>>,
    volumes: Mutex<HashMap<u32, VolumeRecord>>,
    chapters: Mutex<HashMap<u32, ChapterRecord>>,
    writes: AtomicUsize,
}

impl MemStore {
    fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl NovelStore for MemStore {
    fn upsert_novel(&self, novel: &NovelRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.novels.lock().unwrap().insert(novel.nid, novel.clone());
        Ok(())
    }
    fn upsert_volume(&self, volume: &VolumeRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.vid, volume.clone());
        Ok(())
    }
    fn upsert_chapter(&self, chapter: &ChapterRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.chapters
            .lock()
            .unwrap()
            .insert(chapter.cid, chapter.clone());
        Ok(())
    }
    fn get_novel(&self, nid: u32) -> Result<Option<NovelRecord>, StoreError> {
        Ok(self.novels.lock().unwrap().get(&nid).cloned())
    }
    fn get_volume(&self, vid: u32) -> Result<Option<VolumeRecord>, StoreError> {
        Ok(self.volumes.lock().unwrap().get(&vid).cloned())
    }
    fn get_chapter(&self, cid: u32) -> Result<Option<ChapterRecord>, StoreError> {
        Ok(self.chapters.lock().unwrap().get(&cid).cloned())
    }
    fn list_novels(&self) -> Result<Vec<NovelRecord>, StoreError> {
        Ok(self.novels.lock().unwrap().values().cloned().collect())
    }
    fn volumes_for_novel(&self, nid: u32) -> Result<Vec<VolumeRecord>, StoreError> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.nid == nid)
            .cloned()
            .collect())
    }
    fn chapters_for_volume(&self, vid: u32) -> Result<Vec<ChapterRecord>, StoreError> {
        Ok(self
            .chapters
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.vid == vid)
            .cloned()
            .collect())
    }
    fn chapters_for_novel(&self, nid: u32) -> Result<Vec<ChapterRecord>, StoreError> {
        Ok(self
            .chapters
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.nid == nid)
            .cloned()
            .collect())
    }
    fn mark_novel_done(&self, nid: u32, done: bool) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(n) = self.novels.lock().unwrap().get_mut(&nid) {
            n.done = done;
        }
        Ok(())
    }
    fn mark_volume_done(&self, vid: u32, done: bool) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(v) = self.volumes.lock().unwrap().get_mut(&vid) {
            v.done = done;
        }
        Ok(())
    }
    fn stats(&self) -> Result<Stats, StoreError> {
        // one lock at a time; guards in a single struct expression would
        // re-lock novels while its first guard is still held
        let (total_novels, synced_novels) = {
            let novels = self.novels.lock().unwrap();
            (
                novels.len() as i64,
                novels.values().filter(|n| n.done).count() as i64,
            )
        };
        let total_volumes = self.volumes.lock().unwrap().len() as i64;
        let total_chapters = self.chapters.lock().unwrap().len() as i64;
        Ok(Stats {
            total_novels,
            total_volumes,
            total_chapters,
            synced_novels,
        })
    }
}

struct MockSource {
    novel_pages: HashMap<u32, NovelPage>,
    volume_pages: HashMap<u32, VolumePage>,
    chapters: HashMap<u32, AssembledChapter>,
    fail_volumes: HashSet<u32>,
    fail_chapters: HashSet<u32>,
    novel_calls: AtomicUsize,
    volume_calls: AtomicUsize,
    chapter_calls: AtomicUsize,
}

#[async_trait]
impl NovelSource for MockSource {
    async fn novel(&self, nid: u32) -> Result<NovelPage, SyncError> {
        self.novel_calls.fetch_add(1, Ordering::SeqCst);
        self.novel_pages
            .get(&nid)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("novel {}", nid)))
    }
    async fn volume(&self, _nid: u32, vid: u32) -> Result<VolumePage, SyncError> {
        self.volume_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_volumes.contains(&vid) {
            return Err(SyncError::fetch(
                format!("volume {}", vid),
                std::io::Error::other("connection reset"),
            ));
        }
        self.volume_pages
            .get(&vid)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("volume {}", vid)))
    }
    async fn chapter(&self, _nid: u32, cid: u32) -> Result<AssembledChapter, SyncError> {
        self.chapter_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_chapters.contains(&cid) {
            return Err(SyncError::fetch(
                format!("chapter {}", cid),
                std::io::Error::other("timeout"),
            ));
        }
        self.chapters
            .get(&cid)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("chapter {}", cid)))
    }
    async fn browse(&self, _filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError> {
        Ok(vec![])
    }
    async fn top(&self, _filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError> {
        Ok(vec![])
    }
}

const NID: u32 = 1;
const VOL_UPDATED: i64 = 1_714_521_600;

/// Novel 1 with volumes 10 (chapters 100, 101) and 11 (chapter 200).
fn fixture_source() -> MockSource {
    let novel_page = NovelPage {
        nid: NID,
        name: "novel one".into(),
        authors: vec![Author {
            name: "author".into(),
            role: "author".into(),
        }],
        description: "desc".into(),
        cover: "/img/cover".into(),
        labels: vec!["fantasy".into()],
        updated_at: VOL_UPDATED,
        volumes: vec![
            VolumeSummary {
                vid: 10,
                name: "one".into(),
                ordinal: "第一卷".into(),
            },
            VolumeSummary {
                vid: 11,
                name: "two".into(),
                ordinal: "第二卷".into(),
            },
        ],
    };
    let mut volume_pages = HashMap::new();
    volume_pages.insert(
        10,
        VolumePage {
            vid: 10,
            nid: NID,
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            chapters: vec![
                ChapterSummary {
                    cid: 100,
                    title: "c100".into(),
                },
                ChapterSummary {
                    cid: 101,
                    title: "c101".into(),
                },
            ],
        },
    );
    volume_pages.insert(
        11,
        VolumePage {
            vid: 11,
            nid: NID,
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            chapters: vec![ChapterSummary {
                cid: 200,
                title: "c200".into(),
            }],
        },
    );
    let mut chapters = HashMap::new();
    for cid in [100u32, 101, 200] {
        chapters.insert(
            cid,
            AssembledChapter {
                content: format!("content {}", cid),
                images: vec![],
            },
        );
    }
    let mut novel_pages = HashMap::new();
    novel_pages.insert(NID, novel_page);
    MockSource {
        novel_pages,
        volume_pages,
        chapters,
        fail_volumes: HashSet::new(),
        fail_chapters: HashSet::new(),
        novel_calls: AtomicUsize::new(0),
        volume_calls: AtomicUsize::new(0),
        chapter_calls: AtomicUsize::new(0),
    }
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        volume_delay_min_ms: 0,
        volume_delay_max_ms: 0,
        ..Default::default()
    }
}

fn engine(source: MockSource) -> (Arc<SyncEngine>, Arc<MemStore>, Arc<MockSource>) {
    let source = Arc::new(source);
    let store = Arc::new(MemStore::default());
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&source) as Arc<dyn NovelSource>,
        Arc::clone(&store) as Arc<dyn NovelStore>,
        fast_options(),
        CancellationToken::new(),
    ));
    (engine, store, source)
}

#[tokio::test]
async fn test_full_sync_marks_everything_done() {
    let (engine, store, source) = engine(fixture_source());

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert!(novel.done);
    assert!(store.get_novel(NID).unwrap().unwrap().done);
    for vid in [10, 11] {
        assert!(store.get_volume(vid).unwrap().unwrap().done);
    }
    // chapters persisted with inherited volume timestamp and source order
    let c100 = store.get_chapter(100).unwrap().unwrap();
    assert_eq!(c100.updated_at, VOL_UPDATED);
    assert_eq!(c100.index, 0);
    assert_eq!(store.get_chapter(101).unwrap().unwrap().index, 1);
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 3);

    let stats = store.stats().unwrap();
    assert_eq!(stats.synced_novels, 1);
    assert_eq!(stats.total_chapters, 3);
}

#[tokio::test]
async fn test_fresh_done_novel_short_circuits_with_zero_work() {
    let (engine, store, source) = engine(fixture_source());
    store
        .upsert_novel(&NovelRecord {
            nid: NID,
            name: "stored".into(),
            authors: vec![],
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            fetched_at: now_ts(),
            done: true,
        })
        .unwrap();
    let before = store.write_count();

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert_eq!(novel.name, "stored");
    assert_eq!(source.novel_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.write_count(), before);
}

#[tokio::test]
async fn test_stale_pending_novel_resyncs() {
    let (engine, store, source) = engine(fixture_source());
    // incomplete sync two hours ago: outside the 1 h pending window
    store
        .upsert_novel(&NovelRecord {
            nid: NID,
            name: "stale".into(),
            authors: vec![],
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: 0,
            fetched_at: now_ts() - 7200,
            done: false,
        })
        .unwrap();

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert_eq!(novel.name, "novel one");
    assert_eq!(source.novel_calls.load(Ordering::SeqCst), 1);
    assert!(novel.done);
}

#[tokio::test]
async fn test_volume_failure_is_counted_not_escalated() {
    let mut source = fixture_source();
    source.fail_volumes.insert(11);
    let (engine, store, source) = engine(source);

    let novel = engine.update_novel(NID, false).await.unwrap();
    // the sync itself succeeds, but the novel stays incomplete
    assert!(!novel.done);
    assert!(!store.get_novel(NID).unwrap().unwrap().done);
    // the healthy volume still synced fully
    assert!(store.get_volume(10).unwrap().unwrap().done);
    assert!(store.get_chapter(100).unwrap().is_some());
    assert!(store.get_volume(11).unwrap().is_none());

    let progress = engine.novel_progress(NID).unwrap();
    assert_eq!(progress.volumes_synced, 1);
    assert_eq!(progress.volumes_failed, 1);
    assert!(!progress.in_progress);
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_chapter_failure_aborts_its_volume() {
    let mut source = fixture_source();
    source.fail_chapters.insert(100);
    let (engine, store, source) = engine(source);

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert!(!novel.done);
    // volume 10 aborted on its first chapter: not done, later chapter not fetched
    assert!(!store.get_volume(10).unwrap().unwrap().done);
    assert!(store.get_chapter(101).unwrap().is_none());
    // volume 11 unaffected
    assert!(store.get_volume(11).unwrap().unwrap().done);
    assert!(store.get_chapter(200).unwrap().is_some());
    // cid 100 failed, 101 never attempted, 200 fetched
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resync_skips_chapters_already_current() {
    let (engine, _store, source) = engine(fixture_source());
    engine.update_novel(NID, false).await.unwrap();
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 3);

    // forced re-sync re-reads metadata but not unchanged chapters
    let novel = engine.update_novel(NID, true).await.unwrap();
    assert!(novel.done);
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 3);
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_get_chapter_syncs_parent_volume_on_miss() {
    let (engine, store, source) = engine(fixture_source());

    let chapter = engine.get_chapter(NID, 10, 101).await.unwrap();
    assert_eq!(chapter.content, "content 101");
    assert_eq!(chapter.updated_at, VOL_UPDATED);
    // the whole volume was brought in, named off the parent novel's list
    assert!(store.get_chapter(100).unwrap().is_some());
    let volume = store.get_volume(10).unwrap().unwrap();
    assert_eq!(volume.name, "one");
    assert_eq!(volume.ordinal, "第一卷");

    // second read is served from the store
    engine.get_chapter(NID, 10, 101).await.unwrap();
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_done_volume_with_newer_upstream_is_refetched() {
    let (engine, store, source) = engine(fixture_source());
    // confirmed-complete volume, recently read, but the source has moved on
    store
        .upsert_volume(&VolumeRecord {
            vid: 10,
            nid: NID,
            name: "one".into(),
            ordinal: "第一卷".into(),
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED - 100,
            fetched_at: now_ts(),
            done: true,
        })
        .unwrap();

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert!(novel.done);
    // both volume pages were read; recency of the stored row is irrelevant
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 2);
    // the advanced timestamp forced a full chapter sync of volume 10
    assert!(store.get_chapter(100).unwrap().is_some());
    assert!(store.get_chapter(101).unwrap().is_some());
    let volume = store.get_volume(10).unwrap().unwrap();
    assert_eq!(volume.updated_at, VOL_UPDATED);
    assert!(volume.done);
}

#[tokio::test]
async fn test_done_volume_current_upstream_skips_chapter_work() {
    let (engine, store, source) = engine(fixture_source());
    // complete and as new as the source reports, even if read long ago
    store
        .upsert_volume(&VolumeRecord {
            vid: 10,
            nid: NID,
            name: "one".into(),
            ordinal: "第一卷".into(),
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            fetched_at: now_ts() - 999_999,
            done: true,
        })
        .unwrap();

    let novel = engine.update_novel(NID, false).await.unwrap();
    assert!(novel.done);
    // the page is still consulted for the comparison
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 2);
    // but only volume 11's chapter was fetched
    assert_eq!(source.chapter_calls.load(Ordering::SeqCst), 1);
    assert!(store.get_chapter(100).unwrap().is_none());
    assert!(store.get_chapter(200).unwrap().is_some());
}

#[tokio::test]
async fn test_get_chapter_vanished_volume_is_not_found() {
    let mut source = fixture_source();
    // the volume page still resolves upstream, but the novel no longer lists it
    source.volume_pages.insert(
        99,
        VolumePage {
            vid: 99,
            nid: NID,
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            chapters: vec![ChapterSummary {
                cid: 500,
                title: "orphan".into(),
            }],
        },
    );
    let (engine, store, source) = engine(source);

    let err = engine.get_chapter(NID, 99, 500).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    // refused before any volume fetch
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 0);
    assert!(store.get_volume(99).unwrap().is_none());
}

#[tokio::test]
async fn test_progress_tracked_per_novel() {
    let mut source = fixture_source();
    source.novel_pages.insert(
        2,
        NovelPage {
            nid: 2,
            name: "novel two".into(),
            authors: vec![],
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            volumes: vec![VolumeSummary {
                vid: 20,
                name: "only".into(),
                ordinal: "第一卷".into(),
            }],
        },
    );
    source.volume_pages.insert(
        20,
        VolumePage {
            vid: 20,
            nid: 2,
            description: String::new(),
            cover: String::new(),
            labels: vec![],
            updated_at: VOL_UPDATED,
            chapters: vec![ChapterSummary {
                cid: 300,
                title: "c300".into(),
            }],
        },
    );
    source.chapters.insert(
        300,
        AssembledChapter {
            content: "content 300".into(),
            images: vec![],
        },
    );
    let (engine, _store, _source) = engine(source);

    engine.update_novel(NID, false).await.unwrap();
    engine.update_novel(2, false).await.unwrap();

    // the second sync must not clobber the first novel's entry
    let first = engine.novel_progress(NID).unwrap();
    assert_eq!(first.volumes_total, 2);
    assert_eq!(first.volumes_synced, 2);
    let second = engine.novel_progress(2).unwrap();
    assert_eq!(second.volumes_total, 1);
    assert_eq!(second.volumes_synced, 1);
    assert_eq!(engine.progress().len(), 2);
}

#[tokio::test]
async fn test_get_chapter_unknown_cid_is_not_found() {
    let (engine, _store, _source) = engine(fixture_source());
    let err = engine.get_chapter(NID, 10, 999).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn test_schedule_update_deduplicates() {
    let (engine, _store, _source) = engine(fixture_source());
    assert!(engine.schedule_update(NID));
    // second request while the first is queued/running is rejected
    assert!(!engine.schedule_update(NID));

    // wait for the background task to drain
    for _ in 0..100 {
        if !engine.is_scheduled(NID) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!engine.is_scheduled(NID));
    // and the slot is reusable afterwards
    assert!(engine.schedule_update(NID));
}

#[tokio::test]
async fn test_cancellation_stops_between_volumes() {
    let source = Arc::new(fixture_source());
    let store = Arc::new(MemStore::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = SyncEngine::new(
        Arc::clone(&source) as Arc<dyn NovelSource>,
        Arc::clone(&store) as Arc<dyn NovelStore>,
        fast_options(),
        cancel,
    );

    let novel = engine.update_novel(NID, false).await.unwrap();
    // metadata landed, but no volume work ran and nothing is done
    assert!(!novel.done);
    assert_eq!(source.volume_calls.load(Ordering::SeqCst), 0);
    assert!(store.get_volume(10).unwrap().is_none());
}
