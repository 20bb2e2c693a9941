use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

struct TtlEntry<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

impl<V> TtlEntry<V> {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }
}

/// Concurrent map with optional per-entry TTL.
///
/// Expired entries are dropped lazily on access and in bulk by
/// [`TtlMap::sweep_expired`], which the owning provider runs from its
/// periodic cleanup task.
pub struct TtlMap<V> {
    entries: DashMap<String, TtlEntry<V>>,
}

impl<V: Clone> TtlMap<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a value, replacing any existing entry. A non-positive TTL
    /// yields an entry that is already expired.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Utc::now() + ttl);
        self.entries.insert(key.into(), TtlEntry { value, expires_at });
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(_, entry)| entry.value)
    }

    /// Mutate an entry in place. Returns whether the entry existed.
    pub fn update<F>(&self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                mutate(&mut entry.value);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of live entries.
    pub fn entries(&self) -> Vec<(String, V)> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Drop every expired entry. Returns the removal count.
    pub fn sweep_expired(&self) -> u64 {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl<V: Clone> Default for TtlMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
