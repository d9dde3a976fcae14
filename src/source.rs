//! Site adapter: fetches pages through the shared browser session and parses
//! them into the normalized models. Every fetch goes through the per-class
//! work queue and a keyed fetch cache (1 h for metadata and listings, 24 h
//! for chapter content), so concurrent duplicate requests collapse into one
//! upstream hit.

use crate::browser::{BrowserError, BrowserSession, FetchOptions};
use crate::cache::{self, FetchCache};
use crate::config::CacheConfig;
use crate::error::SyncError;
use crate::models::{AssembledChapter, ChapterPagePart, NovelPage, NovelSummary, VolumePage};
use crate::queue::{TaskClass, WorkQueue};
use async_trait::async_trait;
use futures::FutureExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(String);

/// Upstream read operations the sync engine depends on. Production uses
/// [`WenkuSource`]; tests substitute scripted mocks.
#[async_trait]
pub trait NovelSource: Send + Sync {
    async fn novel(&self, nid: u32) -> Result<NovelPage, SyncError>;
    async fn volume(&self, nid: u32, vid: u32) -> Result<VolumePage, SyncError>;
    async fn chapter(&self, nid: u32, cid: u32) -> Result<AssembledChapter, SyncError>;
    /// Library browse listing, filterable (page, sort, tag, ...).
    async fn browse(&self, filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError>;
    /// Ranking listing.
    async fn top(&self, filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError>;
}

pub struct WenkuSource {
    session: Arc<BrowserSession>,
    queue: Arc<WorkQueue>,
    novels: FetchCache<NovelPage>,
    volumes: FetchCache<VolumePage>,
    chapters: FetchCache<AssembledChapter>,
    listings: FetchCache<Vec<NovelSummary>>,
    /// Base delay between successive pages of one chapter; the actual sleep
    /// is randomized in `base/2..=base`.
    page_delay_ms: u64,
}

impl WenkuSource {
    pub fn new(
        session: Arc<BrowserSession>,
        queue: Arc<WorkQueue>,
        cache: &CacheConfig,
        page_delay_ms: u64,
    ) -> Self {
        let metadata_ttl = Duration::from_secs(cache.metadata_ttl_secs);
        let chapter_ttl = Duration::from_secs(cache.chapter_ttl_secs);
        let grace = Duration::from_millis(cache.inflight_grace_ms);
        Self {
            session,
            queue,
            novels: FetchCache::new(metadata_ttl, cache.capacity, grace),
            volumes: FetchCache::new(metadata_ttl, cache.capacity, grace),
            chapters: FetchCache::new(chapter_ttl, cache.capacity, grace),
            listings: FetchCache::new(metadata_ttl, cache.capacity, grace),
            page_delay_ms,
        }
    }

    async fn listing(
        &self,
        tag: &str,
        path: &'static str,
        filters: &[(String, String)],
    ) -> Result<Vec<NovelSummary>, SyncError> {
        let key = cache::filter_key(tag, filters.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let session = Arc::clone(&self.session);
        let queue = Arc::clone(&self.queue);
        let url = listing_url(path, filters);
        self.listings
            .get_or_fetch(&key, move || {
                async move {
                    let html = queue
                        .run(TaskClass::Listing, session.fetch(&url, FetchOptions::selector(".grid")))
                        .await
                        .map_err(|e| browser_err(&url, e))?;
                    parse::listing(&html)
                }
                .boxed()
            })
            .await
    }
}

#[async_trait]
impl NovelSource for WenkuSource {
    async fn novel(&self, nid: u32) -> Result<NovelPage, SyncError> {
        let session = Arc::clone(&self.session);
        let queue = Arc::clone(&self.queue);
        self.novels
            .get_or_fetch(&cache::id_key(nid), move || {
                async move {
                    let path = format!("/book/{}.htm", nid);
                    let html = queue
                        .run(TaskClass::Detail, session.fetch(&path, FetchOptions::selector("#content")))
                        .await
                        .map_err(|e| browser_err(&path, e))?;
                    parse::novel_page(&html, nid)
                }
                .boxed()
            })
            .await
    }

    async fn volume(&self, nid: u32, vid: u32) -> Result<VolumePage, SyncError> {
        let session = Arc::clone(&self.session);
        let queue = Arc::clone(&self.queue);
        self.volumes
            .get_or_fetch(&cache::pair_key(nid, vid), move || {
                async move {
                    let path = format!("/book/{}/vol/{}.htm", nid, vid);
                    let html = queue
                        .run(TaskClass::Detail, session.fetch(&path, FetchOptions::selector("#content")))
                        .await
                        .map_err(|e| browser_err(&path, e))?;
                    parse::volume_page(&html, nid, vid)
                }
                .boxed()
            })
            .await
    }

    /// Fetch a chapter, following its page indicator across source pages.
    async fn chapter(&self, nid: u32, cid: u32) -> Result<AssembledChapter, SyncError> {
        let session = Arc::clone(&self.session);
        let queue = Arc::clone(&self.queue);
        let delay_ms = self.page_delay_ms;
        self.chapters
            .get_or_fetch(&cache::pair_key(nid, cid), move || {
                async move {
                    let fetch = move |page: u32| {
                        let session = Arc::clone(&session);
                        let queue = Arc::clone(&queue);
                        async move { fetch_chapter_part(&session, &queue, nid, cid, page).await }
                    };
                    assemble_chapter(fetch, delay_ms).await
                }
                .boxed()
            })
            .await
    }

    async fn browse(&self, filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError> {
        self.listing("wenku", "/wenku/index.htm", filters).await
    }

    async fn top(&self, filters: &[(String, String)]) -> Result<Vec<NovelSummary>, SyncError> {
        self.listing("top", "/top.htm", filters).await
    }
}

/// Assemble a chapter by walking its page indicator: page contents are
/// concatenated in page order, images likewise. Pages after the first are
/// paced by the configured delay.
async fn assemble_chapter<F, Fut>(
    mut fetch_page: F,
    delay_ms: u64,
) -> Result<AssembledChapter, SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<ChapterPagePart, SyncError>>,
{
    let first = fetch_page(1).await?;
    let total = first.total_pages.max(1);
    let mut content = first.content;
    let mut images = first.images;
    for page in 2..=total {
        tokio::time::sleep(page_delay(delay_ms)).await;
        let part = fetch_page(page).await?;
        content.push_str(&part.content);
        images.extend(part.images);
    }
    Ok(AssembledChapter { content, images })
}

async fn fetch_chapter_part(
    session: &BrowserSession,
    queue: &WorkQueue,
    nid: u32,
    cid: u32,
    page: u32,
) -> Result<ChapterPagePart, SyncError> {
    let path = if page <= 1 {
        format!("/book/{}/chapter/{}.htm", nid, cid)
    } else {
        format!("/book/{}/chapter/{}_{}.htm", nid, cid, page)
    };
    let html = queue
        .run(TaskClass::Detail, session.fetch(&path, FetchOptions::selector("#content")))
        .await
        .map_err(|e| browser_err(&path, e))?;
    parse::chapter_page(&html, cid)
}

fn listing_url(path: &str, filters: &[(String, String)]) -> String {
    if filters.is_empty() {
        return path.to_string();
    }
    let mut pairs: Vec<String> = filters
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    pairs.sort();
    format!("{}?{}", path, pairs.join("&"))
}

fn browser_err(path: &str, err: BrowserError) -> SyncError {
    match err {
        BrowserError::Blocked(detail) => SyncError::UpstreamBlocked(detail),
        other => SyncError::fetch(path.to_string(), other),
    }
}

fn page_delay(base_ms: u64) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(base_ms / 2..=base_ms))
}

/// HTML extraction for the source's page layouts. Cover and illustration
/// URLs are rewritten through the local image proxy as they are captured.
mod parse {
    use super::ParseError;
    use crate::error::SyncError;
    use crate::helpers::{parse_update_date, transform_url};
    use crate::models::{
        Author, ChapterImage, ChapterPagePart, NovelPage, NovelSummary, VolumePage,
        VolumeSummary,
    };
    use regex::Regex;
    use scraper::{ElementRef, Html, Selector};

    fn malformed(what: &str, detail: &str) -> SyncError {
        SyncError::fetch(what.to_string(), ParseError(detail.to_string()))
    }

    fn is_missing_page(document: &Html) -> bool {
        let err_sel = Selector::parse(".errmsg").unwrap();
        document.select(&err_sel).next().is_some()
    }

    fn text_of(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
        root.select(selector)
            .next()
            .map(|e| e.text().collect::<String>().trim().to_string())
    }

    fn attr_of(root: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
        root.select(selector)
            .next()
            .and_then(|e| e.value().attr(attr))
            .map(|s| s.to_string())
    }

    fn labels_of(root: ElementRef<'_>) -> Vec<String> {
        let sel = Selector::parse(".labels .label").unwrap();
        root.select(&sel)
            .map(|e| e.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn update_ts(root: ElementRef<'_>) -> i64 {
        let sel = Selector::parse("#update").unwrap();
        text_of(root, &sel)
            .and_then(|t| parse_update_date(&t))
            .unwrap_or(0)
    }

    pub fn novel_page(html: &str, nid: u32) -> Result<NovelPage, SyncError> {
        let document = Html::parse_document(html);
        if is_missing_page(&document) {
            return Err(SyncError::NotFound(format!("novel {}", nid)));
        }
        let content_sel = Selector::parse("#content").unwrap();
        let content = document
            .select(&content_sel)
            .next()
            .ok_or_else(|| malformed("novel page", "missing #content"))?;

        let name = text_of(content, &Selector::parse("#title").unwrap())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("novel page", "missing title"))?;

        let author_sel = Selector::parse(".authors a").unwrap();
        let authors = content
            .select(&author_sel)
            .map(|a| Author {
                name: a.text().collect::<String>().trim().to_string(),
                role: a.value().attr("data-role").unwrap_or("author").to_string(),
            })
            .collect();

        let description =
            text_of(content, &Selector::parse(".desc").unwrap()).unwrap_or_default();
        let cover = attr_of(content, &Selector::parse("img#cover").unwrap(), "src")
            .map(|src| transform_url(&src))
            .unwrap_or_default();

        let vid_re = Regex::new(r"vol/(\d+)\.htm").unwrap();
        let volume_sel = Selector::parse(".volumes a.volume").unwrap();
        let ordinal_sel = Selector::parse(".ordinal").unwrap();
        let vname_sel = Selector::parse(".vname").unwrap();
        let mut volumes = Vec::new();
        for a in content.select(&volume_sel) {
            let href = a.value().attr("href").unwrap_or("");
            let Some(cap) = vid_re.captures(href) else {
                continue;
            };
            let Ok(vid) = cap[1].parse::<u32>() else {
                continue;
            };
            volumes.push(VolumeSummary {
                vid,
                name: text_of(a, &vname_sel).unwrap_or_default(),
                ordinal: text_of(a, &ordinal_sel).unwrap_or_default(),
            });
        }

        Ok(NovelPage {
            nid,
            name,
            authors,
            description,
            cover,
            labels: labels_of(content),
            updated_at: update_ts(content),
            volumes,
        })
    }

    pub fn volume_page(html: &str, nid: u32, vid: u32) -> Result<VolumePage, SyncError> {
        let document = Html::parse_document(html);
        if is_missing_page(&document) {
            return Err(SyncError::NotFound(format!("volume {}:{}", nid, vid)));
        }
        let content_sel = Selector::parse("#content").unwrap();
        let content = document
            .select(&content_sel)
            .next()
            .ok_or_else(|| malformed("volume page", "missing #content"))?;

        let cid_re = Regex::new(r"chapter/(\d+)").unwrap();
        let chapter_sel = Selector::parse(".chapters a").unwrap();
        let mut chapters = Vec::new();
        for a in content.select(&chapter_sel) {
            let href = a.value().attr("href").unwrap_or("");
            let Some(cap) = cid_re.captures(href) else {
                continue;
            };
            let Ok(cid) = cap[1].parse::<u32>() else {
                continue;
            };
            chapters.push(crate::models::ChapterSummary {
                cid,
                title: a.text().collect::<String>().trim().to_string(),
            });
        }

        Ok(VolumePage {
            vid,
            nid,
            description: text_of(content, &Selector::parse(".desc").unwrap())
                .unwrap_or_default(),
            cover: attr_of(content, &Selector::parse("img#cover").unwrap(), "src")
                .map(|src| transform_url(&src))
                .unwrap_or_default(),
            labels: labels_of(content),
            updated_at: update_ts(content),
            chapters,
        })
    }

    pub fn chapter_page(html: &str, cid: u32) -> Result<ChapterPagePart, SyncError> {
        let document = Html::parse_document(html);
        if is_missing_page(&document) {
            return Err(SyncError::NotFound(format!("chapter {}", cid)));
        }
        let content_sel = Selector::parse("#content").unwrap();
        let content = document
            .select(&content_sel)
            .next()
            .ok_or_else(|| malformed("chapter page", "missing #content"))?;

        let text_sel = Selector::parse("#text").unwrap();
        let body = content
            .select(&text_sel)
            .next()
            .ok_or_else(|| malformed("chapter page", "missing #text"))?;
        let text = body.text().collect::<String>().trim().to_string();

        let img_sel = Selector::parse("#text img").unwrap();
        let images = content
            .select(&img_sel)
            .filter_map(|img| {
                let src = img.value().attr("src")?;
                Some(ChapterImage {
                    src: transform_url(src),
                    alt: img.value().attr("alt").unwrap_or("").to_string(),
                })
            })
            .collect();

        // "(n/m)" page indicator; absent on single-page chapters
        let page_re = Regex::new(r"\((\d+)/(\d+)\)").unwrap();
        let pages_sel = Selector::parse("#pages").unwrap();
        let (current_page, total_pages) = text_of(content, &pages_sel)
            .and_then(|t| {
                let cap = page_re.captures(&t)?;
                Some((cap[1].parse().ok()?, cap[2].parse().ok()?))
            })
            .unwrap_or((1, 0));

        Ok(ChapterPagePart {
            content: text,
            images,
            current_page,
            total_pages,
        })
    }

    pub fn listing(html: &str) -> Result<Vec<NovelSummary>, SyncError> {
        let document = Html::parse_document(html);
        let grid_sel = Selector::parse(".grid").unwrap();
        if document.select(&grid_sel).next().is_none() {
            return Err(malformed("listing page", "missing .grid"));
        }
        let card_sel = Selector::parse(".grid .novel-card a").unwrap();
        let name_sel = Selector::parse(".name").unwrap();
        let img_sel = Selector::parse("img").unwrap();
        let nid_re = Regex::new(r"book/(\d+)\.htm").unwrap();
        let mut out = Vec::new();
        for a in document.select(&card_sel) {
            let href = a.value().attr("href").unwrap_or("");
            let Some(cap) = nid_re.captures(href) else {
                continue;
            };
            let Ok(nid) = cap[1].parse::<u32>() else {
                continue;
            };
            out.push(NovelSummary {
                nid,
                name: text_of(a, &name_sel).unwrap_or_default(),
                cover: attr_of(a, &img_sel, "src")
                    .map(|src| transform_url(&src))
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

}
