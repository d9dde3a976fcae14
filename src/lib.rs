pub mod app_state;
pub mod browser;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod feeds;
pub mod helpers;
pub mod models;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod sync;
