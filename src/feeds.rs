//! RSS/OPML rendering of persisted novels.

use crate::helpers::xml_escape;
use crate::models::{ChapterRecord, NovelRecord};
use chrono::{TimeZone, Utc};

fn rfc2822(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc2822())
        .unwrap_or_default()
}

/// RSS 2.0 channel for one novel, one item per chapter, newest first.
pub fn novel_rss(novel: &NovelRecord, chapters: &[ChapterRecord], public_url: &str) -> String {
    let mut items = String::new();
    let mut sorted: Vec<&ChapterRecord> = chapters.iter().collect();
    sorted.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then(b.vid.cmp(&a.vid))
            .then(b.index.cmp(&a.index))
    });
    for chapter in sorted {
        let link = format!(
            "{}/novel/{}/chapter/{}",
            public_url, chapter.nid, chapter.cid
        );
        items.push_str(&format!(
            "    <item>\n      <title>{}</title>\n      <link>{}</link>\n      <guid isPermaLink=\"false\">{}</guid>\n      <pubDate>{}</pubDate>\n      <description><![CDATA[{}]]></description>\n    </item>\n",
            xml_escape(&chapter.title),
            xml_escape(&link),
            chapter.cid,
            rfc2822(chapter.updated_at),
            chapter.content,
        ));
    }

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\">\n  <channel>\n    <title>{}</title>\n    <link>{}/novel/{}</link>\n    <description>{}</description>\n    <lastBuildDate>{}</lastBuildDate>\n{}  </channel>\n</rss>\n",
        xml_escape(&novel.name),
        public_url,
        novel.nid,
        xml_escape(&novel.description),
        rfc2822(novel.updated_at),
        items,
    )
}

/// OPML index of every persisted novel's RSS feed.
pub fn opml(novels: &[NovelRecord], public_url: &str) -> String {
    let mut outlines = String::new();
    for novel in novels {
        outlines.push_str(&format!(
            "    <outline type=\"rss\" text=\"{}\" title=\"{}\" xmlUrl=\"{}/novel/{}/rss\"/>\n",
            xml_escape(&novel.name),
            xml_escape(&novel.name),
            public_url,
            novel.nid,
        ));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<opml version=\"2.0\">\n  <head><title>novels</title></head>\n  <body>\n{}  </body>\n</opml>\n",
        outlines,
    )
}
