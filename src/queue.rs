//! Per-class admission gates for fetch operations.
//!
//! Listing-page fetches share one slot so burst traffic cannot stack index
//! crawls on top of each other; detail fetches get a slightly wider bound.
//! Waiters are released in FIFO order (tokio semaphores are fair).

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    /// Index/listing pages (library browse, rankings).
    Listing,
    /// Novel, volume and chapter detail pages.
    Detail,
}

pub struct WorkQueue {
    listing: Arc<Semaphore>,
    detail: Arc<Semaphore>,
}

impl WorkQueue {
    pub fn new(listing_limit: usize, detail_limit: usize) -> Self {
        Self {
            listing: Arc::new(Semaphore::new(listing_limit.max(1))),
            detail: Arc::new(Semaphore::new(detail_limit.max(1))),
        }
    }

    /// Run `task` once a slot for its class frees up.
    pub async fn run<T, F>(&self, class: TaskClass, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let semaphore = match class {
            TaskClass::Listing => &self.listing,
            TaskClass::Detail => &self.detail,
        };
        // the semaphores are never closed
        let _permit = semaphore.acquire().await.unwrap();
        task.await
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(1, 2)
    }
}
