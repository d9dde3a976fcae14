//! Shared browser session with automatic reconnect.
//!
//! One remote (or locally launched) Chrome connection backs all page fetches.
//! The connection is created lazily, probed for liveness before page
//! creation, and fully torn down and rebuilt between fetch attempts. The
//! session state sits behind an async mutex, so only one reconnect can be in
//! flight at a time: concurrent callers wanting a connection await the
//! in-progress attempt instead of starting their own.

use super::config::BrowserConfig;
use crate::retry::{self, RetryOptions};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser connection failed: {0}")]
    Connection(String),

    #[error("page creation failed: {0}")]
    Page(String),

    #[error("navigation failed for {path}: {detail}")]
    Navigation { path: String, detail: String },

    #[error("timed out waiting for '{selector}' on {path}")]
    SelectorTimeout { selector: String, path: String },

    #[error("anti-automation challenge on {0}")]
    Blocked(String),
}

/// Per-fetch options. `selector` blocks until the element appears (bounded
/// by `timeout`); `base_url` overrides the session's configured origin.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub selector: Option<String>,
    pub timeout: Option<Duration>,
    pub base_url: Option<String>,
}

impl FetchOptions {
    pub fn selector(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            ..Default::default()
        }
    }
}

pub struct BrowserSession {
    config: BrowserConfig,
    base_url: String,
    state: tokio::sync::Mutex<Option<Arc<Browser>>>,
}

impl BrowserSession {
    pub fn new(config: BrowserConfig, base_url: impl Into<String>) -> Self {
        Self {
            config,
            base_url: base_url.into(),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Navigate a fresh page to `path` (resolved against the base origin) and
    /// return the document HTML. Retries with full session teardown between
    /// attempts; a required-selector timeout counts as an attempt like any
    /// navigation failure.
    pub async fn fetch(&self, path: &str, opts: FetchOptions) -> Result<String, BrowserError> {
        let url = self.resolve_url(path, opts.base_url.as_deref());
        let mut attempt = 1usize;
        loop {
            // pace requests against an established session; the first request
            // after (re)connection goes out immediately
            if self.is_connected().await {
                tokio::time::sleep(jittered(self.config.request_delay_ms)).await;
            }
            match self.fetch_once(&url, &opts).await {
                Ok(html) => {
                    if let Some(marker) = blocked_marker(&html) {
                        let err = BrowserError::Blocked(format!("{} ({})", url, marker));
                        if attempt >= self.config.max_attempts {
                            return Err(err);
                        }
                        log::warn!("{}; recycling session", err);
                    } else {
                        return Ok(html);
                    }
                }
                Err(err) => {
                    if attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    log::warn!(
                        "fetch attempt {}/{} for {} failed: {}",
                        attempt,
                        self.config.max_attempts,
                        url,
                        err
                    );
                }
            }
            tokio::time::sleep(jittered(self.config.reconnect_delay_ms)).await;
            self.teardown().await;
            attempt += 1;
        }
    }

    /// Create a new page on the shared connection, establishing or rebuilding
    /// the connection as needed. If page creation fails on a live-looking
    /// connection, forces one full reconnect and tries exactly once more.
    pub async fn new_page(&self) -> Result<Arc<Tab>, BrowserError> {
        let mut state = self.state.lock().await;
        let browser = self.ensure_session(&mut state).await?;
        let browser = if Self::alive(&browser).await {
            browser
        } else {
            log::warn!("browser connection lost, reconnecting");
            *state = None;
            self.ensure_session(&mut state).await?
        };
        match Self::open_tab(browser).await {
            Ok(tab) => Ok(tab),
            Err(err) => {
                log::warn!("page creation failed ({}), forcing reconnect", err);
                *state = None;
                let browser = self.ensure_session(&mut state).await?;
                Self::open_tab(browser).await
            }
        }
    }

    /// Best-effort teardown; never fails.
    pub async fn close(&self) {
        self.teardown().await;
        log::debug!("browser session closed");
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn teardown(&self) {
        // dropping the last handle closes the underlying connection
        self.state.lock().await.take();
    }

    async fn ensure_session(
        &self,
        state: &mut Option<Arc<Browser>>,
    ) -> Result<Arc<Browser>, BrowserError> {
        match state {
            Some(browser) => Ok(Arc::clone(browser)),
            None => {
                log::info!("establishing browser connection");
                let config = self.config.clone();
                let browser = retry::retry(
                    move |_cancel| {
                        let config = config.clone();
                        async move {
                            tokio::task::spawn_blocking(move || launch(&config))
                                .await
                                .map_err(|e| BrowserError::Connection(e.to_string()))?
                        }
                    },
                    2,
                    &RetryOptions::default(),
                )
                .await?;
                let browser = Arc::new(browser);
                *state = Some(Arc::clone(&browser));
                Ok(browser)
            }
        }
    }

    async fn alive(browser: &Arc<Browser>) -> bool {
        let browser = Arc::clone(browser);
        tokio::task::spawn_blocking(move || browser.get_version().is_ok())
            .await
            .unwrap_or(false)
    }

    async fn open_tab(browser: Arc<Browser>) -> Result<Arc<Tab>, BrowserError> {
        tokio::task::spawn_blocking(move || {
            browser
                .new_tab()
                .map_err(|e| BrowserError::Page(e.to_string()))
        })
        .await
        .map_err(|e| BrowserError::Page(e.to_string()))?
    }

    async fn fetch_once(&self, url: &str, opts: &FetchOptions) -> Result<String, BrowserError> {
        let tab = self.new_page().await?;
        let url = url.to_string();
        let selector = opts.selector.clone();
        let timeout = opts
            .timeout
            .unwrap_or(Duration::from_secs(self.config.nav_timeout_secs));
        let screenshot_dir = self.config.screenshot_dir.clone();
        tokio::task::spawn_blocking(move || {
            let result = navigate_and_read(&tab, &url, selector.as_deref(), timeout);
            if result.is_err() {
                if let Some(dir) = screenshot_dir {
                    dump_screenshot(&tab, &dir, &url);
                }
            }
            let _ = tab.close(true);
            result
        })
        .await
        .map_err(|e| BrowserError::Page(e.to_string()))?
    }

    fn resolve_url(&self, path: &str, base_override: Option<&str>) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = base_override.unwrap_or(&self.base_url);
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn launch(config: &BrowserConfig) -> Result<Browser, BrowserError> {
    if let Some(url) = &config.connect_url {
        return Browser::connect(url.clone()).map_err(|e| BrowserError::Connection(e.to_string()));
    }

    use std::ffi::OsStr;
    let user_agent_arg = config
        .user_agent
        .as_ref()
        .map(|ua| format!("--user-agent={}", ua));
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--no-sandbox"),
    ];
    if let Some(ref ua) = user_agent_arg {
        args.push(OsStr::new(ua));
    }

    let options = LaunchOptions::default_builder()
        .headless(config.headless)
        .window_size(Some(config.window_size))
        .args(args)
        .build()
        .map_err(|e| BrowserError::Connection(e.to_string()))?;
    Browser::new(options).map_err(|e| BrowserError::Connection(e.to_string()))
}

fn navigate_and_read(
    tab: &Tab,
    url: &str,
    selector: Option<&str>,
    timeout: Duration,
) -> Result<String, BrowserError> {
    tab.navigate_to(url)
        .map_err(|e| BrowserError::Navigation {
            path: url.to_string(),
            detail: e.to_string(),
        })?
        .wait_until_navigated()
        .map_err(|e| BrowserError::Navigation {
            path: url.to_string(),
            detail: e.to_string(),
        })?;
    if let Some(sel) = selector {
        tab.wait_for_element_with_custom_timeout(sel, timeout)
            .map_err(|_| BrowserError::SelectorTimeout {
                selector: sel.to_string(),
                path: url.to_string(),
            })?;
    }
    tab.get_content().map_err(|e| BrowserError::Navigation {
        path: url.to_string(),
        detail: e.to_string(),
    })
}

/// Best-effort diagnostic screenshot; capture or write failures are ignored.
fn dump_screenshot(tab: &Tab, dir: &str, url: &str) {
    let slug: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let path = format!(
        "{}/{}_{}.png",
        dir.trim_end_matches('/'),
        chrono::Utc::now().timestamp(),
        &slug[slug.len().saturating_sub(48)..]
    );
    if let Ok(data) = tab.capture_screenshot(
        Page::CaptureScreenshotFormatOption::Png,
        None,
        None,
        true,
    ) {
        match std::fs::write(&path, data) {
            Ok(()) => log::info!("saved failure screenshot to {}", path),
            Err(e) => log::debug!("screenshot write failed: {}", e),
        }
    }
}

fn jittered(base_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=base_ms.saturating_mul(2)))
}

/// Anti-automation interstitial markers checked on every fetched document.
fn blocked_marker(html: &str) -> Option<&'static str> {
    const MARKERS: &[&str] = &[
        "cf-challenge-running",
        "cf-browser-verification",
        "Just a moment",
        "challenge-form",
    ];
    MARKERS.iter().find(|m| html.contains(**m)).copied()
}
