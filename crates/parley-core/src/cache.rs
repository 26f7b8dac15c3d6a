//! Process-wide session cache with LRU eviction and per-key change fan-out.
//!
//! The cache is the single source of truth for a session's message list. Any
//! number of controllers may share one key; every `set` is broadcast to all
//! current subscribers of that key. Entries are bounded by an LRU policy,
//! where both reads and writes count as recent use.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::message::Message;

/// Default bound on the number of cached sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Buffered updates per subscriber before it starts lagging.
const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Addresses one shared message history: endpoint plus session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(endpoint: &str, session_id: &str) -> Self {
        Self(format!("{endpoint}::{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for the session cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of session histories kept in memory.
    pub max_sessions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl CacheConfig {
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }
}

struct CacheInner {
    entries: LruCache<SessionKey, Vec<Message>>,
    watchers: HashMap<SessionKey, broadcast::Sender<Vec<Message>>>,
}

/// Keyed store mapping a session key to its message history.
///
/// Constructed once and passed (`Arc`-wrapped) to every controller; there is
/// no hidden global instance.
pub struct SessionCache {
    inner: Mutex<CacheInner>,
}

impl SessionCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.max_sessions)
            .ok_or_else(|| Error::Configuration("max_sessions must be > 0".to_string()))?;
        Ok(Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                watchers: HashMap::new(),
            }),
        })
    }

    /// Look up a session's history. Counts as recent use for eviction.
    pub fn get(&self, key: &SessionKey) -> Option<Vec<Message>> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get(key).cloned()
    }

    /// Replace a session's history and notify all subscribers of the key.
    ///
    /// Inserting may evict the least-recently-used entry when the bound is
    /// exceeded; the evicted key's subscriber channel stays intact.
    pub fn set(&self, key: &SessionKey, messages: Vec<Message>) {
        let notify = {
            let mut inner = self.inner.lock().unwrap();
            if let Some((evicted, _)) = inner.entries.push(key.clone(), messages.clone())
                && evicted != *key
            {
                tracing::debug!(session_key = %evicted, "evicted LRU session");
            }
            match inner.watchers.get(key) {
                Some(tx) if tx.receiver_count() > 0 => Some(tx.clone()),
                Some(_) => {
                    inner.watchers.remove(key);
                    None
                }
                None => None,
            }
        };
        if let Some(tx) = notify {
            let _ = tx.send(messages);
        }
    }

    /// Subscribe to every subsequent `set` for the given key.
    pub fn subscribe(&self, key: &SessionKey) -> broadcast::Receiver<Vec<Message>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .watchers
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Number of session histories currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the key is currently cached, without touching recency.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.inner.lock().unwrap().entries.contains(key)
    }
}
