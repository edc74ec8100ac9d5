//! Public Key Caching
//!
//! In-memory layer in front of the remote actor table. Entries are replaced
//! whole under the write lock, so readers never see a half-updated key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

const CACHE_NAME: &str = "public_key";

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// Actor IRI that owns the key
    owner: String,
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    /// TTL for this entry
    ttl: Duration,
}

impl CachedKey {
    /// Check if this cache entry is still valid
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Key owner and PEM served from cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPublicKey {
    pub owner: String,
    pub pem: String,
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by key id.
pub struct PublicKeyCache {
    /// Cache storage: key_id -> cached key
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    /// Default TTL for cached keys
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `default_ttl` - Default TTL for cached keys (default: 1 hour)
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get a live entry for a key ID
    pub async fn get(&self, key_id: &str) -> Option<CachedPublicKey> {
        let cache = self.cache.read().await;
        match cache.get(key_id) {
            Some(cached) if cached.is_valid() => {
                tracing::debug!(key_id = %key_id, "Public key cache hit");
                CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                Some(CachedPublicKey {
                    owner: cached.owner.clone(),
                    pem: cached.pem.clone(),
                })
            }
            Some(_) => {
                tracing::debug!(key_id = %key_id, "Public key cache expired");
                CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                None
            }
            None => {
                CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                None
            }
        }
    }

    /// Insert or replace the entry for a key ID
    pub async fn insert(&self, key_id: &str, owner: &str, pem: &str) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key_id.to_string(),
            CachedKey {
                owner: owner.to_string(),
                pem: pem.to_string(),
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(cache.len() as i64);
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
    }

    /// Drop every key owned by an actor
    pub async fn invalidate_owner(&self, owner: &str) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, v| v.owner != owner);
        CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(cache.len() as i64);
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();
        let expired = total - valid;

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: expired,
        }
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let after = cache.len();
        let removed = before - after;
        CACHE_SIZE.with_label_values(&[CACHE_NAME]).set(after as i64);

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
