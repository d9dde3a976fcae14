use crate::config::Config;
use crate::db::NovelStore;
use crate::source::NovelSource;
use crate::sync::SyncEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state handed to every route handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn NovelStore>,
    pub source: Arc<dyn NovelSource>,
    pub engine: Arc<SyncEngine>,
    /// Plain HTTP client for the image proxy; page fetches go through the
    /// browser session instead.
    pub http: reqwest::Client,
    pub cancel: CancellationToken,
}
