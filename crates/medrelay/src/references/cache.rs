//! Per-conversation store of withheld reference text
//!
//! Bounded in both size (least recently used entries are evicted) and
//! age (entries older than the TTL read as absent). A TTL of zero keeps
//! entries until evicted by size.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::config::ReferenceCacheConfig;

/// Capacity used when the configured one is zero
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug)]
struct CachedReferences {
    text: String,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ReferenceCache {
    entries: Mutex<LruCache<String, CachedReferences>>,
    ttl: Option<Duration>,
}

impl ReferenceCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    pub fn from_config(config: &ReferenceCacheConfig) -> Self {
        Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
    }

    /// Store references for a conversation, replacing earlier ones
    pub fn store(&self, conversation_id: &str, references: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            conversation_id,
            bytes = references.len(),
            "Caching withheld references"
        );
        entries.put(
            conversation_id.to_string(),
            CachedReferences {
                text: references,
                stored_at: Instant::now(),
            },
        );
    }

    /// References for a conversation, if cached and not expired
    pub fn get(&self, conversation_id: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let expired = match entries.get(conversation_id) {
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.stored_at.elapsed() > ttl),
            None => return None,
        };

        if expired {
            entries.pop(conversation_id);
            return None;
        }

        entries.get(conversation_id).map(|entry| entry.text.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::from_config(&ReferenceCacheConfig::default())
    }
}
