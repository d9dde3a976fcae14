pub mod config;
pub mod session;

pub use config::BrowserConfig;
pub use session::{BrowserError, BrowserSession, FetchOptions};
