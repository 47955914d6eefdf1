//! GET response cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::ApiResponse;

/// TTL cache for GET responses, keyed by request signature.
///
/// A fresh hit short-circuits the network entirely. Entries are evicted
/// lazily on lookup and wholesale on [`ResponseCache::clear`] (session
/// teardown).
#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CachedEntry>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    stored_at: Instant,
    response: ApiResponse,
}

impl ResponseCache {
    /// Creates a cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns a fresh cached response, evicting the entry if it expired.
    pub fn get(&self, signature: &str) -> Option<ApiResponse> {
        let hit = self.entries.get(signature).map(|entry| entry.clone());
        match hit {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                debug!(signature, "Response cache hit");
                Some(entry.response)
            }
            Some(_) => {
                self.entries.remove(signature);
                None
            }
            None => None,
        }
    }

    /// Stores a response under the signature.
    pub fn insert(&self, signature: String, response: ApiResponse) {
        self.entries.insert(
            signature,
            CachedEntry {
                stored_at: Instant::now(),
                response,
            },
        );
    }

    /// Drops every cached response.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached entries (including not-yet-evicted stale ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
