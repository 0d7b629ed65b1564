//! TTL response cache
//!
//! Holds previously fetched response bodies keyed by request identity.
//! An entry is valid while `now - timestamp < ttl`; an expired entry is
//! treated as absent and evicted on the next lookup.
//!
//! Keys have the form `METHOD:endpoint:digest`, where `digest` is a SHA-256
//! prefix of the canonical request body (or `-` without a body). Keeping the
//! endpoint readable inside the key is what lets pattern invalidation work.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// A cached value with its freshness metadata
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: Instant,
    pub ttl: Duration,
    pub etag: Option<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration, etag: Option<String>) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
            ttl,
            etag,
        }
    }

    /// Valid iff `now - timestamp < ttl`
    pub fn is_valid(&self) -> bool {
        self.timestamp.elapsed() < self.ttl
    }
}

/// Build the deterministic cache/dedup key for a request
pub fn cache_key(method: &str, endpoint: &str, body: Option<&Value>) -> String {
    let digest = match body {
        // serde_json's default map is ordered, so `to_string` is canonical
        Some(body) => {
            let hash = Sha256::digest(body.to_string().as_bytes());
            hex::encode(&hash[..8])
        }
        None => "-".to_string(),
    };
    format!("{}:{}:{}", method, endpoint, digest)
}

/// Endpoint part of a key produced by [`cache_key`]
fn key_endpoint(key: &str) -> &str {
    let rest = key.split_once(':').map(|(_, rest)| rest).unwrap_or(key);
    rest.rsplit_once(':').map(|(endpoint, _)| endpoint).unwrap_or(rest)
}

/// Whether the endpoint of `key` is `path` or lies below it
pub(crate) fn key_within_path(key: &str, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    let endpoint = key_endpoint(key);
    endpoint == path
        || endpoint
            .strip_prefix(path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// TTL-keyed store of response values
#[derive(Debug, Default)]
pub struct ResponseCache<T = Value> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh value for `key`, evicting it if it has expired
    pub fn get(&self, key: &str) -> Option<T> {
        self.entry(key).map(|entry| entry.data)
    }

    /// Fresh entry (value plus metadata) for `key`
    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                Some(entry) if entry.is_valid() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|entry| !entry.is_valid()) {
            entries.remove(key);
            debug!(key = %key, "Evicted expired cache entry");
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, data: T, ttl: Duration, etag: Option<String>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.into(), CacheEntry::new(data, ttl, etag));
    }

    /// Remove every key containing `pattern`; returns the number removed
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.remove_where(|key| key.contains(pattern))
    }

    /// Remove every entry whose endpoint is `path` or lies below it.
    ///
    /// Matches on path-segment boundaries, so `/projects/p1` never touches
    /// `/projects/p10`.
    pub fn invalidate_path(&self, path: &str) -> usize {
        self.remove_where(|key| key_within_path(key, path))
    }

    /// Drop entries whose TTL has lapsed
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid());
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Physical entry count, including expired-but-not-yet-evicted entries
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !matches(key));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Invalidated cache entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_is_deterministic() {
        let body = json!({"components": ["a", "b"], "type": "unlock"});
        let a = cache_key("POST", "/projects/p1/locks/check-conflicts", Some(&body));
        let b = cache_key("POST", "/projects/p1/locks/check-conflicts", Some(&body.clone()));
        assert_eq!(a, b);
        assert!(a.starts_with("POST:/projects/p1/locks/check-conflicts:"));

        let other = cache_key("POST", "/projects/p1/locks/check-conflicts", Some(&json!({})));
        assert_ne!(a, other);
        assert_eq!(cache_key("GET", "/projects/p1/locks", None), "GET:/projects/p1/locks:-");
    }

    #[test]
    fn test_key_endpoint_extraction() {
        assert_eq!(key_endpoint("GET:/projects/p1/locks:-"), "/projects/p1/locks");
        assert_eq!(key_endpoint("PUT:/projects/p1/locks/c1:abcd"), "/projects/p1/locks/c1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_within_ttl_then_expire() {
        let cache: ResponseCache<u32> = ResponseCache::new();
        cache.set("k", 7, Duration::from_secs(5), None);
        assert_eq!(cache.get("k"), Some(7));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(cache.get("k"), Some(7));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty(), "expired entry should be evicted on lookup");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_physically_present_until_evicted() {
        let cache: ResponseCache<u32> = ResponseCache::new();
        cache.set("a", 1, Duration::from_secs(1), None);
        cache.set("b", 2, Duration::from_secs(60), Some("\"v2\"".to_string()));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.entry("b").and_then(|e| e.etag), Some("\"v2\"".to_string()));
    }

    #[test]
    fn test_invalidate_by_substring() {
        let cache: ResponseCache<u32> = ResponseCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("GET:/projects/p1/locks:-", 1, ttl, None);
        cache.set("GET:/projects/p1/locks/audit:-", 2, ttl, None);
        cache.set("GET:/projects/p2/locks:-", 3, ttl, None);

        assert_eq!(cache.invalidate("/projects/p1/"), 2);
        assert_eq!(cache.get("GET:/projects/p2/locks:-"), Some(3));
    }

    #[test]
    fn test_invalidate_path_respects_segments() {
        let cache: ResponseCache<u32> = ResponseCache::new();
        let ttl = Duration::from_secs(60);
        cache.set(cache_key("GET", "/projects/p1/locks", None), 1, ttl, None);
        cache.set(cache_key("GET", "/projects/p1/locks/audit", None), 2, ttl, None);
        cache.set(cache_key("GET", "/projects/p10/locks", None), 3, ttl, None);

        assert_eq!(cache.invalidate_path("/projects/p1"), 2);
        assert_eq!(cache.get(&cache_key("GET", "/projects/p10/locks", None)), Some(3));
    }

    #[test]
    fn test_clear() {
        let cache: ResponseCache<u32> = ResponseCache::new();
        cache.set("a", 1, Duration::from_secs(1), None);
        cache.clear();
        assert!(cache.is_empty());
    }
}
