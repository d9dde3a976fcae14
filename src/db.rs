//! SQLite persistence for novels, volumes and chapters.
//!
//! List-valued fields (authors, labels, images) are stored as JSON text.
//! Writes are idempotent upserts keyed on the source-assigned ids.

use crate::models::{ChapterRecord, NovelRecord, Stats, VolumeRecord};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("column encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Storage seam for the sync engine. The production implementation is
/// [`SqliteStore`]; tests substitute an in-memory recording mock.
pub trait NovelStore: Send + Sync {
    fn upsert_novel(&self, novel: &NovelRecord) -> Result<(), StoreError>;
    fn upsert_volume(&self, volume: &VolumeRecord) -> Result<(), StoreError>;
    fn upsert_chapter(&self, chapter: &ChapterRecord) -> Result<(), StoreError>;

    fn get_novel(&self, nid: u32) -> Result<Option<NovelRecord>, StoreError>;
    fn get_volume(&self, vid: u32) -> Result<Option<VolumeRecord>, StoreError>;
    fn get_chapter(&self, cid: u32) -> Result<Option<ChapterRecord>, StoreError>;

    fn list_novels(&self) -> Result<Vec<NovelRecord>, StoreError>;
    fn volumes_for_novel(&self, nid: u32) -> Result<Vec<VolumeRecord>, StoreError>;
    fn chapters_for_volume(&self, vid: u32) -> Result<Vec<ChapterRecord>, StoreError>;
    fn chapters_for_novel(&self, nid: u32) -> Result<Vec<ChapterRecord>, StoreError>;

    fn mark_novel_done(&self, nid: u32, done: bool) -> Result<(), StoreError>;
    fn mark_volume_done(&self, vid: u32, done: bool) -> Result<(), StoreError>;

    fn stats(&self) -> Result<Stats, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    log::info!("Creating tables if not exists...");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS novels (
            nid INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            authors TEXT NOT NULL,
            description TEXT NOT NULL,
            cover TEXT NOT NULL,
            labels TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            done INTEGER NOT NULL DEFAULT 0
        );",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS volumes (
            vid INTEGER PRIMARY KEY,
            nid INTEGER NOT NULL,
            name TEXT NOT NULL,
            ordinal TEXT NOT NULL,
            description TEXT NOT NULL,
            cover TEXT NOT NULL,
            labels TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (nid) REFERENCES novels (nid)
        );",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chapters (
            cid INTEGER PRIMARY KEY,
            vid INTEGER NOT NULL,
            nid INTEGER NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            images TEXT NOT NULL,
            idx INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            fetched_at INTEGER NOT NULL,
            FOREIGN KEY (vid) REFERENCES volumes (vid)
        );",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_volumes_nid ON volumes(nid);",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chapters_vid ON chapters(vid);",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chapters_nid ON chapters(nid);",
        [],
    )?;

    log::info!("Tables ensured.");
    Ok(())
}

fn novel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(NovelRecord, String, String)> {
    Ok((
        NovelRecord {
            nid: row.get(0)?,
            name: row.get(1)?,
            authors: Vec::new(),
            description: row.get(3)?,
            cover: row.get(4)?,
            labels: Vec::new(),
            updated_at: row.get(6)?,
            fetched_at: row.get(7)?,
            done: row.get::<_, i64>(8)? != 0,
        },
        row.get(2)?,
        row.get(5)?,
    ))
}

fn decode_novel(raw: (NovelRecord, String, String)) -> Result<NovelRecord, StoreError> {
    let (mut novel, authors, labels) = raw;
    novel.authors = serde_json::from_str(&authors)?;
    novel.labels = serde_json::from_str(&labels)?;
    Ok(novel)
}

fn volume_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(VolumeRecord, String)> {
    Ok((
        VolumeRecord {
            vid: row.get(0)?,
            nid: row.get(1)?,
            name: row.get(2)?,
            ordinal: row.get(3)?,
            description: row.get(4)?,
            cover: row.get(5)?,
            labels: Vec::new(),
            updated_at: row.get(7)?,
            fetched_at: row.get(8)?,
            done: row.get::<_, i64>(9)? != 0,
        },
        row.get(6)?,
    ))
}

fn decode_volume(raw: (VolumeRecord, String)) -> Result<VolumeRecord, StoreError> {
    let (mut volume, labels) = raw;
    volume.labels = serde_json::from_str(&labels)?;
    Ok(volume)
}

fn chapter_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ChapterRecord, String)> {
    Ok((
        ChapterRecord {
            cid: row.get(0)?,
            vid: row.get(1)?,
            nid: row.get(2)?,
            title: row.get(3)?,
            content: row.get(4)?,
            images: Vec::new(),
            index: row.get(6)?,
            updated_at: row.get(7)?,
            fetched_at: row.get(8)?,
        },
        row.get(5)?,
    ))
}

fn decode_chapter(raw: (ChapterRecord, String)) -> Result<ChapterRecord, StoreError> {
    let (mut chapter, images) = raw;
    chapter.images = serde_json::from_str(&images)?;
    Ok(chapter)
}

const NOVEL_COLS: &str =
    "nid, name, authors, description, cover, labels, updated_at, fetched_at, done";
const VOLUME_COLS: &str =
    "vid, nid, name, ordinal, description, cover, labels, updated_at, fetched_at, done";
const CHAPTER_COLS: &str =
    "cid, vid, nid, title, content, images, idx, updated_at, fetched_at";

impl NovelStore for SqliteStore {
    fn upsert_novel(&self, novel: &NovelRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO novels (nid, name, authors, description, cover, labels, updated_at, fetched_at, done)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(nid) DO UPDATE SET
                name=excluded.name,
                authors=excluded.authors,
                description=excluded.description,
                cover=excluded.cover,
                labels=excluded.labels,
                updated_at=excluded.updated_at,
                fetched_at=excluded.fetched_at,
                done=excluded.done",
            params![
                novel.nid,
                novel.name,
                serde_json::to_string(&novel.authors)?,
                novel.description,
                novel.cover,
                serde_json::to_string(&novel.labels)?,
                novel.updated_at,
                novel.fetched_at,
                novel.done as i64,
            ],
        )?;
        Ok(())
    }

    fn upsert_volume(&self, volume: &VolumeRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO volumes (vid, nid, name, ordinal, description, cover, labels, updated_at, fetched_at, done)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(vid) DO UPDATE SET
                nid=excluded.nid,
                name=excluded.name,
                ordinal=excluded.ordinal,
                description=excluded.description,
                cover=excluded.cover,
                labels=excluded.labels,
                updated_at=excluded.updated_at,
                fetched_at=excluded.fetched_at,
                done=excluded.done",
            params![
                volume.vid,
                volume.nid,
                volume.name,
                volume.ordinal,
                volume.description,
                volume.cover,
                serde_json::to_string(&volume.labels)?,
                volume.updated_at,
                volume.fetched_at,
                volume.done as i64,
            ],
        )?;
        Ok(())
    }

    fn upsert_chapter(&self, chapter: &ChapterRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chapters (cid, vid, nid, title, content, images, idx, updated_at, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(cid) DO UPDATE SET
                vid=excluded.vid,
                nid=excluded.nid,
                title=excluded.title,
                content=excluded.content,
                images=excluded.images,
                idx=excluded.idx,
                updated_at=excluded.updated_at,
                fetched_at=excluded.fetched_at",
            params![
                chapter.cid,
                chapter.vid,
                chapter.nid,
                chapter.title,
                chapter.content,
                serde_json::to_string(&chapter.images)?,
                chapter.index,
                chapter.updated_at,
                chapter.fetched_at,
            ],
        )?;
        Ok(())
    }

    fn get_novel(&self, nid: u32) -> Result<Option<NovelRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM novels WHERE nid = ?1",
            NOVEL_COLS
        ))?;
        let mut rows = stmt.query_map(params![nid], novel_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_novel(raw?)?)),
            None => Ok(None),
        }
    }

    fn get_volume(&self, vid: u32) -> Result<Option<VolumeRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM volumes WHERE vid = ?1",
            VOLUME_COLS
        ))?;
        let mut rows = stmt.query_map(params![vid], volume_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_volume(raw?)?)),
            None => Ok(None),
        }
    }

    fn get_chapter(&self, cid: u32) -> Result<Option<ChapterRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chapters WHERE cid = ?1",
            CHAPTER_COLS
        ))?;
        let mut rows = stmt.query_map(params![cid], chapter_from_row)?;
        match rows.next() {
            Some(raw) => Ok(Some(decode_chapter(raw?)?)),
            None => Ok(None),
        }
    }

    fn list_novels(&self) -> Result<Vec<NovelRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM novels ORDER BY updated_at DESC",
            NOVEL_COLS
        ))?;
        let rows = stmt.query_map([], novel_from_row)?;
        let mut novels = Vec::new();
        for raw in rows {
            novels.push(decode_novel(raw?)?);
        }
        Ok(novels)
    }

    fn volumes_for_novel(&self, nid: u32) -> Result<Vec<VolumeRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM volumes WHERE nid = ?1 ORDER BY vid",
            VOLUME_COLS
        ))?;
        let rows = stmt.query_map(params![nid], volume_from_row)?;
        let mut volumes = Vec::new();
        for raw in rows {
            volumes.push(decode_volume(raw?)?);
        }
        Ok(volumes)
    }

    fn chapters_for_volume(&self, vid: u32) -> Result<Vec<ChapterRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chapters WHERE vid = ?1 ORDER BY idx",
            CHAPTER_COLS
        ))?;
        let rows = stmt.query_map(params![vid], chapter_from_row)?;
        let mut chapters = Vec::new();
        for raw in rows {
            chapters.push(decode_chapter(raw?)?);
        }
        Ok(chapters)
    }

    fn chapters_for_novel(&self, nid: u32) -> Result<Vec<ChapterRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chapters WHERE nid = ?1 ORDER BY vid, idx",
            CHAPTER_COLS
        ))?;
        let rows = stmt.query_map(params![nid], chapter_from_row)?;
        let mut chapters = Vec::new();
        for raw in rows {
            chapters.push(decode_chapter(raw?)?);
        }
        Ok(chapters)
    }

    fn mark_novel_done(&self, nid: u32, done: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE novels SET done = ?1 WHERE nid = ?2",
            params![done as i64, nid],
        )?;
        Ok(())
    }

    fn mark_volume_done(&self, vid: u32, done: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE volumes SET done = ?1 WHERE vid = ?2",
            params![done as i64, vid],
        )?;
        Ok(())
    }

    fn stats(&self) -> Result<Stats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total_novels: i64 = conn.query_row("SELECT COUNT(*) FROM novels", [], |r| r.get(0))?;
        let total_volumes: i64 =
            conn.query_row("SELECT COUNT(*) FROM volumes", [], |r| r.get(0))?;
        let total_chapters: i64 =
            conn.query_row("SELECT COUNT(*) FROM chapters", [], |r| r.get(0))?;
        let synced_novels: i64 =
            conn.query_row("SELECT COUNT(*) FROM novels WHERE done = 1", [], |r| {
                r.get(0)
            })?;
        Ok(Stats {
            total_novels,
            total_volumes,
            total_chapters,
            synced_novels,
        })
    }
}
