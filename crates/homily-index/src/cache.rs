//! Short-TTL memoization of general-search results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::pagination::PageSize;

/// Default time-to-live for cached searches.
pub const DEFAULT_TTL: Duration = Duration::from_millis(4000);

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self.elapsed.lock().map(|e| *e).unwrap_or_default();
        self.start + elapsed
    }
}

struct Entry<V> {
    stored_at: Instant,
    value: V,
}

/// A TTL cache keyed by normalized query.
///
/// Expired entries are dropped lazily on lookup and on insert; there is no
/// background sweep.
pub struct QueryCache<V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Normalized tokens joined, then `|`, then the page size.
    pub fn key(tokens: &[String], limit: PageSize) -> String {
        format!("{}|{}", tokens.join(" "), limit.as_i64())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if now.duration_since(entry.stored_at) < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value`, replacing any previous entry for `key`.
    pub fn insert(&self, key: String, value: V) {
        let now = self.clock.now();
        let ttl = self.ttl;
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, e| now.duration_since(e.stored_at) < ttl);
            entries.insert(
                key,
                Entry {
                    stored_at: now,
                    value,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the fresh value for `key`, or run `compute` and return its value.
    ///
    /// `compute` also says whether its value may be stored. The boolean in the
    /// result is `true` on a cache hit. Errors are never stored. The lock is not
    /// held while `compute` runs, so concurrent misses may both compute and the
    /// later insert wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, compute: F) -> Result<(V, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, bool), E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, true));
        }
        let (value, cacheable) = compute().await?;
        if cacheable {
            self.insert(key.to_string(), value.clone());
        }
        Ok((value, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            QueryCache::<u32>::key(&tokens(&["love", "god's"]), PageSize::Limited(20)),
            "love god's|20"
        );
        assert_eq!(QueryCache::<u32>::key(&tokens(&["grace"]), PageSize::Unlimited), "grace|-1");
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = QueryCache::with_clock(DEFAULT_TTL, clock.clone());
        cache.insert("k".into(), 1);

        clock.advance(Duration::from_millis(3999));
        assert_eq!(cache.get("k"), Some(1));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_overwrites_and_sweeps() {
        let clock = Arc::new(ManualClock::new());
        let cache = QueryCache::with_clock(Duration::from_secs(1), clock.clone());
        cache.insert("old".into(), 1);
        clock.advance(Duration::from_secs(2));
        cache.insert("new".into(), 2);
        cache.insert("new".into(), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("new"), Some(3));
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with() {
        let clock = Arc::new(ManualClock::new());
        let cache: QueryCache<u32> = QueryCache::with_clock(DEFAULT_TTL, clock.clone());

        let (v, hit) = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>((7, true)) })
            .await
            .unwrap();
        assert_eq!((v, hit), (7, false));

        let (v, hit) = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>((8, true)) })
            .await
            .unwrap();
        assert_eq!((v, hit), (7, true));

        clock.advance(DEFAULT_TTL);
        let (v, hit) = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>((9, true)) })
            .await
            .unwrap();
        assert_eq!((v, hit), (9, false));
    }

    #[tokio::test]
    async fn test_uncacheable_values_and_errors_are_not_stored() {
        let cache: QueryCache<u32> = QueryCache::new(DEFAULT_TTL);
        let (v, hit) = cache
            .get_or_try_insert_with("k", || async { Ok::<_, ()>((1, false)) })
            .await
            .unwrap();
        assert_eq!((v, hit), (1, false));
        assert!(cache.is_empty());

        let err = cache
            .get_or_try_insert_with("k", || async { Err::<(u32, bool), _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.is_empty());
    }
}
