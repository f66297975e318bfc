//! Upstream client cache: a memoized, bounded factory for upstream
//! capability handles. Generalizes `PoolManager`'s pattern of lazily
//! constructing one `reqwest::Client` per adapter into an explicit bounded
//! LRU, since handles here are keyed per secret key and need eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BackendFlavor;
use crate::fingerprint::fingerprint;
use crate::upstream::{GoogleImageClient, UpstreamClient};

const PER_KEY_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KeyCacheKey {
    fingerprint: String,
    flavor: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProjectCacheKey {
    project: String,
    location: String,
    timeout_ms: u64,
}

struct Inner {
    entries: HashMap<KeyCacheKey, Arc<dyn UpstreamClient>>,
    recency: VecDeque<KeyCacheKey>,
    project_slot: Option<(ProjectCacheKey, Arc<dyn UpstreamClient>)>,
}

/// Memoized, bounded construction of upstream capability handles. At most
/// [`PER_KEY_CAPACITY`] per-key handles are retained; the least-recently
/// used entry is evicted to make room for a new one. A separate one-slot
/// cache holds the project-mode handle.
pub struct ClientCache {
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

impl ClientCache {
    pub fn new(http_timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(http_timeout_ms))
            .build()
            .expect("reqwest client configuration is always valid");

        Self {
            http,
            inner: Mutex::new(Inner { entries: HashMap::new(), recency: VecDeque::new(), project_slot: None }),
        }
    }

    /// Handle for a specific secret key and resolved backend flavor.
    /// Construction happens under the cache's own lock, so two concurrent
    /// callers for the same key never build two handles (avoids a
    /// thundering herd against the same key).
    pub fn for_key(&self, api_key: &str, flavor: BackendFlavor) -> Arc<dyn UpstreamClient> {
        let cache_key = KeyCacheKey { fingerprint: fingerprint(api_key), flavor: flavor as u8 };
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.entries.get(&cache_key) {
            let handle = existing.clone();
            inner.recency.retain(|k| k != &cache_key);
            inner.recency.push_back(cache_key);
            return handle;
        }

        let handle: Arc<dyn UpstreamClient> =
            Arc::new(GoogleImageClient::for_api_key(self.http.clone(), api_key.to_string(), flavor));

        if inner.entries.len() >= PER_KEY_CAPACITY {
            if let Some(oldest) = inner.recency.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(cache_key.clone(), handle.clone());
        inner.recency.push_back(cache_key);
        handle
    }

    /// Handle for project/Vertex-scoped auth. Single-slot: a new
    /// `(project, location, timeout)` triple simply replaces the slot.
    pub fn for_project(&self, project: &str, location: &str) -> Arc<dyn UpstreamClient> {
        let cache_key =
            ProjectCacheKey { project: project.to_string(), location: location.to_string(), timeout_ms: 0 };
        let mut inner = self.inner.lock().unwrap();

        if let Some((existing_key, handle)) = &inner.project_slot {
            if existing_key == &cache_key {
                return handle.clone();
            }
        }

        let handle: Arc<dyn UpstreamClient> =
            Arc::new(GoogleImageClient::for_project(self.http.clone(), project.to_string(), location.to_string()));
        inner.project_slot = Some((cache_key, handle.clone()));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_handle_for_same_key_and_flavor() {
        let cache = ClientCache::new(5_000);
        let a = cache.for_key("AIzaSame", BackendFlavor::Developer);
        let b = cache.for_key("AIzaSame", BackendFlavor::Developer);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_flavor_yields_distinct_handle() {
        let cache = ClientCache::new(5_000);
        let a = cache.for_key("AIzaSame", BackendFlavor::Developer);
        let b = cache.for_key("AIzaSame", BackendFlavor::Project);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let cache = ClientCache::new(5_000);
        let mut handles = Vec::new();
        for i in 0..PER_KEY_CAPACITY {
            handles.push(cache.for_key(&format!("AIzaKey{i}"), BackendFlavor::Developer));
        }
        // one more insertion should evict key 0
        cache.for_key("AIzaKeyOverflow", BackendFlavor::Developer);
        let rebuilt_first = cache.for_key("AIzaKey0", BackendFlavor::Developer);
        assert!(!Arc::ptr_eq(&handles[0], &rebuilt_first));
    }

    #[test]
    fn project_slot_replaced_by_new_triple() {
        let cache = ClientCache::new(5_000);
        let a = cache.for_project("proj-a", "us-central1");
        let b = cache.for_project("proj-b", "us-central1");
        let a_again = cache.for_project("proj-a", "us-central1");
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &a_again));
    }
}
