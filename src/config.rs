use crate::browser::BrowserConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Origin of the upstream novel site.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Public origin used in feed links (`<link>`, OPML `xmlUrl`).
    #[serde(default = "default_public_url")]
    pub public_url: String,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// TTL for novel/volume metadata and listing pages, in seconds.
    #[serde(default = "default_metadata_ttl")]
    pub metadata_ttl_secs: u64,

    /// TTL for assembled chapter content, in seconds.
    #[serde(default = "default_chapter_ttl")]
    pub chapter_ttl_secs: u64,

    /// Max entries per cache before LRU eviction.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How long a resolved in-flight entry keeps serving duplicates.
    #[serde(default = "default_grace")]
    pub inflight_grace_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Freshness window for novels whose last sync completed, in seconds.
    #[serde(default = "default_fresh_done")]
    pub fresh_done_secs: i64,

    /// Freshness window for novels with an incomplete sync, in seconds.
    #[serde(default = "default_fresh_pending")]
    pub fresh_pending_secs: i64,

    /// Bounds of the random pause between volume syncs, in milliseconds.
    #[serde(default = "default_volume_delay_min")]
    pub volume_delay_min_ms: u64,
    #[serde(default = "default_volume_delay_max")]
    pub volume_delay_max_ms: u64,

    /// Concurrent listing fetches.
    #[serde(default = "default_listing_limit")]
    pub listing_limit: usize,

    /// Concurrent detail fetches.
    #[serde(default = "default_detail_limit")]
    pub detail_limit: usize,

    /// Interval between scheduler passes, in seconds.
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_db_path() -> String {
    "novels.db".to_string()
}
fn default_base_url() -> String {
    "https://www.wenku8.net".to_string()
}
fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_metadata_ttl() -> u64 {
    3600
}
fn default_chapter_ttl() -> u64 {
    86_400
}
fn default_capacity() -> usize {
    1024
}
fn default_grace() -> u64 {
    2000
}
fn default_fresh_done() -> i64 {
    86_400
}
fn default_fresh_pending() -> i64 {
    3600
}
fn default_volume_delay_min() -> u64 {
    1000
}
fn default_volume_delay_max() -> u64 {
    2000
}
fn default_listing_limit() -> usize {
    1
}
fn default_detail_limit() -> usize {
    2
}
fn default_scheduler_interval() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: default_metadata_ttl(),
            chapter_ttl_secs: default_chapter_ttl(),
            capacity: default_capacity(),
            inflight_grace_ms: default_grace(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fresh_done_secs: default_fresh_done(),
            fresh_pending_secs: default_fresh_pending(),
            volume_delay_min_ms: default_volume_delay_min(),
            volume_delay_max_ms: default_volume_delay_max(),
            listing_limit: default_listing_limit(),
            detail_limit: default_detail_limit(),
            scheduler_interval_secs: default_scheduler_interval(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let path = Path::new("config.toml");
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                match toml::from_str::<Config>(&content) {
                    Ok(cfg) => return cfg,
                    Err(e) => log::warn!("config.toml ignored: {}", e),
                }
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.cache.metadata_ttl_secs, 3600);
        assert_eq!(cfg.cache.chapter_ttl_secs, 86_400);
        assert_eq!(cfg.sync.fresh_done_secs, 86_400);
        assert_eq!(cfg.sync.fresh_pending_secs, 3600);
        assert_eq!(cfg.sync.listing_limit, 1);
        assert_eq!(cfg.sync.detail_limit, 2);
    }

    #[test]
    fn test_partial_toml_fills_rest() {
        let cfg: Config = toml::from_str(
            r#"
            port = 9000
            [sync]
            detail_limit = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.sync.detail_limit, 4);
        assert_eq!(cfg.sync.listing_limit, 1);
        assert_eq!(cfg.cache.capacity, 1024);
    }
}
