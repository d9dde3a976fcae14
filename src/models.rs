use serde::{Deserialize, Serialize};

/// Author entry as listed on the novel page (a novel can credit several
/// people under different roles, e.g. author/illustrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterImage {
    pub src: String,
    pub alt: String,
}

/// Persisted novel row. `done` is true once every volume and chapter beneath
/// it has been fully synced without error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelRecord {
    pub nid: u32,
    pub name: String,
    pub authors: Vec<Author>,
    pub description: String,
    pub cover: String,
    pub labels: Vec<String>,
    /// Source-reported last-change timestamp (unix seconds).
    pub updated_at: i64,
    /// Local fetch timestamp (unix seconds).
    pub fetched_at: i64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub vid: u32,
    pub nid: u32,
    pub name: String,
    /// Ordinal label as shown on the novel page ("第一卷", "Vol. 2", ...).
    pub ordinal: String,
    pub description: String,
    pub cover: String,
    pub labels: Vec<String>,
    pub updated_at: i64,
    pub fetched_at: i64,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub cid: u32,
    pub vid: u32,
    pub nid: u32,
    pub title: String,
    pub content: String,
    pub images: Vec<ChapterImage>,
    /// Position within the parent volume, in source order.
    pub index: u32,
    /// Inherited from the parent volume's fetched `updated_at`; the source
    /// exposes no per-chapter timestamp.
    pub updated_at: i64,
    pub fetched_at: i64,
}

/// Volume entry as it appears on a novel's index page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub vid: u32,
    pub name: String,
    pub ordinal: String,
}

/// Chapter entry as it appears on a volume's detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub cid: u32,
    pub title: String,
}

/// Freshly fetched and parsed novel page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelPage {
    pub nid: u32,
    pub name: String,
    pub authors: Vec<Author>,
    pub description: String,
    pub cover: String,
    pub labels: Vec<String>,
    pub updated_at: i64,
    pub volumes: Vec<VolumeSummary>,
}

impl NovelPage {
    /// Build the persisted row for this page. `done` is false unconditionally:
    /// a novel is never marked done until every volume is confirmed synced.
    pub fn to_record(&self, fetched_at: i64) -> NovelRecord {
        NovelRecord {
            nid: self.nid,
            name: self.name.clone(),
            authors: self.authors.clone(),
            description: self.description.clone(),
            cover: self.cover.clone(),
            labels: self.labels.clone(),
            updated_at: self.updated_at,
            fetched_at,
            done: false,
        }
    }
}

/// Freshly fetched and parsed volume detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumePage {
    pub vid: u32,
    pub nid: u32,
    pub description: String,
    pub cover: String,
    pub labels: Vec<String>,
    pub updated_at: i64,
    pub chapters: Vec<ChapterSummary>,
}

/// One page of a (possibly multi-page) chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPagePart {
    pub content: String,
    pub images: Vec<ChapterImage>,
    pub current_page: u32,
    /// 0 when the source gives no page indicator (single-page chapter).
    pub total_pages: u32,
}

/// Fully assembled chapter content, concatenated across source pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledChapter {
    pub content: String,
    pub images: Vec<ChapterImage>,
}

/// Novel entry on a listing/ranking page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelSummary {
    pub nid: u32,
    pub name: String,
    pub cover: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stats {
    pub total_novels: i64,
    pub total_volumes: i64,
    pub total_chapters: i64,
    pub synced_novels: i64,
}
