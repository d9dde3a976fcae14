use serde::Deserialize;

/// Configuration for the shared browser session.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// DevTools websocket of a remote Chrome to attach to. When unset, a
    /// local headless instance is launched instead.
    #[serde(default)]
    pub connect_url: Option<String>,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_window_size")]
    pub window_size: (u32, u32),

    /// Timeout for navigation and selector waits, in seconds.
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,

    /// Total fetch attempts, inclusive of the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Base inter-request delay; actual delay is randomized in
    /// `0..=2*base` ("base ± base" jitter).
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Base delay before tearing down and rebuilding the session between
    /// fetch attempts, jittered the same way.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Directory for diagnostic screenshots on fetch failure. Disabled when
    /// unset; capture failures are ignored.
    #[serde(default)]
    pub screenshot_dir: Option<String>,

    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_window_size() -> (u32, u32) {
    (1920, 1080)
}
fn default_nav_timeout() -> u64 {
    60
}
fn default_max_attempts() -> usize {
    3
}
fn default_request_delay() -> u64 {
    5000
}
fn default_reconnect_delay() -> u64 {
    10_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            connect_url: None,
            headless: true,
            window_size: default_window_size(),
            nav_timeout_secs: default_nav_timeout(),
            max_attempts: default_max_attempts(),
            request_delay_ms: default_request_delay(),
            reconnect_delay_ms: default_reconnect_delay(),
            screenshot_dir: None,
            user_agent: None,
        }
    }
}
