//! Shared key/value cache with invalidation notifications.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

/// Notification sent to subscribers when an entry leaves the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<K> {
    /// The entry outlived the soft time-to-live and was dropped on access.
    Expiring(K),
    /// The entry was removed explicitly.
    Released(K),
}

type Listener<K> = Arc<dyn Fn(&CacheEvent<K>) + Send + Sync>;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Thread-safe cache shared by concurrent readers.
///
/// Writers race freely; the last `set` for a key wins. Entries older than
/// the optional soft TTL are treated as missing and evicted when next read.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use biota_core::{Cache, CacheEvent};
///
/// let cache: Cache<&str, u32> = Cache::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// cache.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
///
/// cache.set("a", 1);
/// assert_eq!(cache.get(&"a"), Some(1));
/// cache.clear();
/// assert_eq!(*seen.lock().unwrap(), vec![CacheEvent::Released("a")]);
/// ```
pub struct Cache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    listeners: RwLock<Vec<Listener<K>>>,
    soft_ttl: Option<Duration>,
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Cache")
            .field("entries", &entries)
            .field("soft_ttl", &self.soft_ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            soft_ttl: None,
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache without expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache whose entries expire `ttl` after they were stored.
    pub fn with_soft_ttl(ttl: Duration) -> Self {
        Self {
            soft_ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Fetch a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.get(key)?;
            if !self.is_stale(entry) {
                return Some(entry.value.clone());
            }
        }

        let evicted = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            // Another writer may have refreshed the entry in the meantime.
            match entries.get(key) {
                Some(entry) if self.is_stale(entry) => entries.remove(key).is_some(),
                Some(entry) => return Some(entry.value.clone()),
                None => false,
            }
        };
        if evicted {
            self.notify(&CacheEvent::Expiring(key.clone()));
        }
        None
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn set(&self, key: K, value: V) {
        let entry = Entry {
            value,
            stored_at: Instant::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Remove one entry, returning whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            self.notify(&CacheEvent::Released(key.clone()));
        }
        removed
    }

    /// Drop every entry and notify subscribers once per key.
    pub fn clear(&self) {
        let released: Vec<K> = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(key, _)| key)
            .collect();
        for key in released {
            self.notify(&CacheEvent::Released(key));
        }
    }

    /// Number of stored entries, including stale ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a callback for [`CacheEvent`]s.
    ///
    /// Callbacks run on the thread that triggered the event, after the
    /// cache lock has been released. A callback may use the cache, including
    /// `subscribe`; listeners added during a notification first hear the
    /// next event.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&CacheEvent<K>) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    fn is_stale(&self, entry: &Entry<V>) -> bool {
        self.soft_ttl
            .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl)
    }

    fn notify(&self, event: &CacheEvent<K>) {
        let listeners: Vec<Listener<K>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener(event);
        }
    }
}
