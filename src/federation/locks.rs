//! Keyed entity locks
//!
//! Serializes effect application per follow pair, object or actor without a
//! global lock. Callers lock every key their mutations touch; keys are taken
//! in sorted order so two callers with overlapping sets cannot deadlock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock key for a follow relationship
pub fn follow_key(follower: &str, followee: &str) -> String {
    format!("follow:{}|{}", follower, followee)
}

/// Lock key for a content object
pub fn object_key(iri: &str) -> String {
    format!("object:{}", iri)
}

/// Lock key for an actor record
pub fn actor_key(iri: &str) -> String {
    format!("actor:{}", iri)
}

/// Held locks; released on drop
pub struct EntityGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Registry of per-entity async mutexes
#[derive(Default)]
pub struct EntityLocks {
    /// Entries are weak so idle keys can be collected
    entries: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in `keys` (duplicates allowed)
    pub async fn lock<I>(&self, keys: I) -> EntityGuard
    where
        I: IntoIterator<Item = String>,
    {
        let ordered: BTreeSet<String> = keys.into_iter().collect();
        let mutexes: Vec<Arc<AsyncMutex<()>>> =
            ordered.iter().map(|key| self.mutex_for(key)).collect();

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }

        EntityGuard { _guards: guards }
    }

    fn mutex_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        // Drop dead entries before growing
        entries.retain(|_, weak| weak.strong_count() > 0);

        let mutex = Arc::new(AsyncMutex::new(()));
        entries.insert(key.to_string(), Arc::downgrade(&mutex));
        mutex
    }

    /// Keys with at least one live holder or waiter
    pub fn active_keys(&self) -> usize {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
