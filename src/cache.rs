//! Short-TTL process-wide caches.
//!
//! Two non-authoritative caches front the manifest pipeline:
//!
//! - [`OriginCache`] deduplicates identical origin fetches across concurrent
//!   viewers. A 1-second TTL stays close to the live edge while eliminating
//!   thundering-herd requests to the origin CDN.
//! - [`MicroCache`] holds fully shaped manifest responses keyed by
//!   `(channel, variant, window-bucket, viewer-bucket)` so that a burst of
//!   identical requests within one bucket is served without re-entering the
//!   pipeline.
//!
//! Both are safe to reset at any time.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default TTL for cached origin manifests.
const ORIGIN_TTL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
struct CachedEntry {
    body: String,
    fetched_at: Instant,
}

/// Thread-safe TTL cache for origin manifest bodies.
#[derive(Clone, Debug)]
pub struct OriginCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    ttl: Duration,
}

impl OriginCache {
    pub fn new() -> Self {
        Self::with_ttl(ORIGIN_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Returns a fresh cached body for the given origin URL, if any.
    pub fn get(&self, url: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(url) {
            if entry.fetched_at.elapsed() < self.ttl {
                debug!("Origin cache HIT for {}", url);
                return Some(entry.body.clone());
            }
            // Stale — drop the read guard before removing
            drop(entry);
            self.entries.remove(url);
        }
        debug!("Origin cache MISS for {}", url);
        None
    }

    pub fn insert(&self, url: &str, body: String) {
        self.entries.insert(
            url.to_string(),
            CachedEntry {
                body,
                fetched_at: Instant::now(),
            },
        );
    }
}

impl Default for OriginCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Response micro-cache keyed by `(channel, variant, window bucket, viewer bucket)`.
///
/// The window bucket is baked into the key, so an entry can never be served
/// across bucket boundaries; the TTL only bounds memory for abandoned keys.
#[derive(Clone, Debug)]
pub struct MicroCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    ttl: Duration,
}

impl MicroCache {
    pub fn new(window_bucket_secs: u64) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl: Duration::from_secs(window_bucket_secs.max(1)),
        }
    }

    /// Compose the cache key from the request tuple.
    pub fn key(
        channel_id: &str,
        variant: &str,
        now_ms: i64,
        bucket_secs: u64,
        viewer_bucket: &str,
    ) -> String {
        let bucket = now_ms / 1000 / bucket_secs.max(1) as i64;
        format!("{}:{}:{}:{}", channel_id, variant, bucket, viewer_bucket)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.entries.get(key) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Some(entry.body.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: &str, body: String) {
        // Opportunistic sweep keeps the map bounded without a reaper task
        if self.entries.len() > 4096 {
            let ttl = self.ttl;
            self.entries.retain(|_, e| e.fetched_at.elapsed() < ttl);
        }
        self.entries.insert(
            key.to_string(),
            CachedEntry {
                body,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_cache_hit_within_ttl() {
        let cache = OriginCache::new();
        cache.insert("https://origin.example.com/live.m3u8", "body".to_string());

        assert_eq!(
            cache.get("https://origin.example.com/live.m3u8"),
            Some("body".to_string())
        );
    }

    #[test]
    fn origin_cache_miss_for_unknown_url() {
        let cache = OriginCache::new();
        assert_eq!(cache.get("https://unknown.example.com/live.m3u8"), None);
    }

    #[test]
    fn origin_cache_miss_after_ttl() {
        let cache = OriginCache::with_ttl(Duration::from_millis(1));
        cache.insert("https://origin.example.com/live.m3u8", "body".to_string());

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(
            cache.get("https://origin.example.com/live.m3u8"),
            None,
            "Entry should be stale after TTL"
        );
    }

    #[test]
    fn micro_key_same_bucket_same_key() {
        let a = MicroCache::key("ch1", "720p.m3u8", 10_000, 2, "A");
        let b = MicroCache::key("ch1", "720p.m3u8", 11_900, 2, "A");
        assert_eq!(a, b);
    }

    #[test]
    fn micro_key_changes_across_bucket_and_viewer() {
        let a = MicroCache::key("ch1", "720p.m3u8", 10_000, 2, "A");
        let b = MicroCache::key("ch1", "720p.m3u8", 12_100, 2, "A");
        let c = MicroCache::key("ch1", "720p.m3u8", 10_000, 2, "B");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn micro_cache_round_trip() {
        let cache = MicroCache::new(2);
        let key = MicroCache::key("ch1", "720p.m3u8", 10_000, 2, "A");
        cache.insert(&key, "#EXTM3U\n".to_string());
        assert_eq!(cache.get(&key), Some("#EXTM3U\n".to_string()));
    }
}
