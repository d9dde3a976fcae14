//! Keyed memoization for fetch results.
//!
//! Two independent layers, composed by [`FetchCache`]:
//!
//! - [`InflightMap`]: deduplicates concurrent calls for the same key. A key
//!   already present (pending or resolved-but-not-evicted) hands the same
//!   shared future to the new caller. Successful entries are evicted after a
//!   short grace window so near-simultaneous duplicates still share one
//!   result; failures are evicted immediately so a failed call never poisons
//!   the next attempt. Eviction is by generation, never blind key deletion,
//!   so a timer firing late cannot evict a newer entry that reused the key.
//! - [`TtlCache`]: stores successful results only, expiring after a fixed TTL
//!   per resource class, with LRU eviction beyond a capacity bound.

use crate::error::SyncError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Derive a cache key for a structured filter: `key=value` pairs sorted
/// lexicographically, joined with `&`, prefixed with a resource-type tag.
/// Sorting makes the key independent of the order callers build filters in.
pub fn filter_key<I, K, V>(tag: &str, filters: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut parts: Vec<String> = filters
        .into_iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
        .collect();
    parts.sort();
    format!("{}:{}", tag, parts.join("&"))
}

/// Key for a single-id lookup.
pub fn id_key(id: u32) -> String {
    id.to_string()
}

/// Key for a two-level lookup (`nid:vid`, `nid:cid`).
pub fn pair_key(nid: u32, sub: u32) -> String {
    format!("{}:{}", nid, sub)
}

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct InflightEntry<T: Clone, E: Clone> {
    generation: u64,
    fut: SharedResult<T, E>,
}

/// In-flight deduplication map. See module docs.
pub struct InflightMap<T: Clone, E: Clone> {
    entries: Arc<Mutex<HashMap<String, InflightEntry<T, E>>>>,
    grace: Duration,
    generations: AtomicU64,
}

impl<T, E> InflightMap<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            grace,
            generations: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key`, unless an entry for the key already exists, in
    /// which case the existing shared future is awaited instead.
    pub async fn run<F>(&self, key: &str, make: F) -> Result<T, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, E>>,
    {
        let fut = {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                entry.fut.clone()
            } else {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let map = Arc::clone(&self.entries);
                let owned_key = key.to_string();
                let grace = self.grace;
                let inner = make();
                let fut: SharedResult<T, E> = async move {
                    let result = inner.await;
                    match &result {
                        Err(_) => evict_generation(&map, &owned_key, generation),
                        Ok(_) => {
                            tokio::spawn(async move {
                                tokio::time::sleep(grace).await;
                                evict_generation(&map, &owned_key, generation);
                            });
                        }
                    }
                    result
                }
                .boxed()
                .shared();
                entries.insert(
                    key.to_string(),
                    InflightEntry {
                        generation,
                        fut: fut.clone(),
                    },
                );
                fut
            }
        };
        fut.await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn evict_generation<T: Clone, E: Clone>(
    map: &Arc<Mutex<HashMap<String, InflightEntry<T, E>>>>,
    key: &str,
    generation: u64,
) {
    let mut entries = map.lock().unwrap();
    if entries.get(key).map(|e| e.generation) == Some(generation) {
        entries.remove(key);
    }
}

struct TtlEntry<T> {
    value: T,
    expires_at: Instant,
    last_used: Instant,
}

/// TTL result cache with LRU eviction beyond `capacity` entries.
pub struct TtlCache<T> {
    entries: Mutex<HashMap<String, TtlEntry<T>>>,
    ttl: Duration,
    capacity: usize,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = entries.get_mut(key) {
            if entry.expires_at > now {
                entry.last_used = now;
                return Some(entry.value.clone());
            }
        }
        entries.remove(key);
        None
    }

    pub fn insert(&self, key: String, value: T) {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            TtlEntry {
                value,
                expires_at: now + self.ttl,
                last_used: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TTL cache composed with in-flight deduplication. A call may hit the TTL
/// cache and skip the network entirely, or fall through to a real fetch that
/// is itself deduplicated.
pub struct FetchCache<T: Clone> {
    results: Arc<TtlCache<T>>,
    inflight: InflightMap<T, SyncError>,
}

impl<T> FetchCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, capacity: usize, grace: Duration) -> Self {
        Self {
            results: Arc::new(TtlCache::new(ttl, capacity)),
            inflight: InflightMap::new(grace),
        }
    }

    pub async fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, SyncError>>,
    {
        if let Some(hit) = self.results.get(key) {
            log::trace!("cache hit: {}", key);
            return Ok(hit);
        }
        let results = Arc::clone(&self.results);
        let owned_key = key.to_string();
        self.inflight
            .run(key, move || {
                let inner = fetch();
                async move {
                    let value = inner.await?;
                    results.insert(owned_key, value.clone());
                    Ok(value)
                }
                .boxed()
            })
            .await
    }
}
