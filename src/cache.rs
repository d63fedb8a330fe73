use log::debug;
use lru::LruCache;
use serde_json::{Map, Value};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime. Short enough that external mailbox changes become
/// visible quickly, long enough to absorb bursts of repeated list/view calls
/// from a human re-running commands.
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Default capacity before least-recently-used eviction kicks in.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

/// The fixed argument dimensions that participate in cache identity.
/// Arguments outside this set deliberately do not affect the key.
const KEY_DIMENSIONS: &[&str] = &["flagged", "folder", "id", "keyword", "limit"];

/// Derive the canonical cache key for a command invocation.
///
/// The key is a `;`-terminated `dim=value` token string over the fixed
/// dimension set, emitted in a stable order, so that two requests differing
/// only in a non-dimension argument land on the same entry and substring
/// invalidation can match whole tokens exactly. `table` is accepted as a
/// synonym for `folder`, and the folder dimension is always present (the
/// router's default folder applies when the request omits it) so folder
/// invalidation reaches implicit-folder requests too.
pub fn cache_key(command: &str, args: &Map<String, Value>) -> String {
    let mut key = format!("cmd={command};");

    for dim in KEY_DIMENSIONS {
        let value = match *dim {
            "folder" => args.get("folder").or_else(|| args.get("table")),
            other => args.get(other),
        };

        match value {
            Some(Value::String(s)) => key.push_str(&format!("{dim}={s};")),
            Some(Value::Number(n)) => key.push_str(&format!("{dim}={n};")),
            Some(Value::Bool(b)) => key.push_str(&format!("{dim}={b};")),
            _ if *dim == "folder" => {
                key.push_str(&format!("{dim}={};", crate::router::DEFAULT_FOLDER))
            }
            _ => {}
        }
    }

    key
}

/// One cached command result. Owned exclusively by the cache; destroyed on
/// TTL expiry, LRU eviction, or explicit invalidation.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    created_at: Instant,
}

/// Snapshot of cache health for the daemon status surface.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_seconds: u64,
    pub usage_pct: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// In-memory LRU cache with TTL and pattern-based invalidation.
///
/// All mutating operations are serialized through one internal lock; the
/// hit/miss/eviction counters are process-lifetime and only ever increase.
pub struct ResultCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = max_entries.max(1);
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity is at least 1"),
            )),
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, Duration::from_secs(DEFAULT_TTL_SECS))
    }

    /// Look up a key, returning the value and its age on a fresh hit.
    /// An expired entry is removed and reported as a miss. A hit moves the
    /// entry to the most-recently-used position atomically with the lookup.
    pub fn get(&self, key: &str) -> Option<(String, Duration)> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        let age = match entries.peek(key) {
            Some(entry) => entry.created_at.elapsed(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if age > self.ttl {
            debug!("🗑️ Cache entry expired ({}s old): {}", age.as_secs(), key);
            entries.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // get() bumps the entry to most-recently-used
        let value = entries.get(key).map(|entry| entry.value.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        value.map(|v| (v, age))
    }

    /// Insert or overwrite a key with a fresh timestamp. When at capacity and
    /// the key is new, the least-recently-used entry is evicted first.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        let entry = CacheEntry {
            value: value.into(),
            created_at: Instant::now(),
        };

        if let Some((evicted_key, _)) = entries.push(key.to_string(), entry) {
            if evicted_key != key {
                debug!("🗑️ LRU eviction: {}", evicted_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove every entry. Used after commands whose blast radius is the
    /// whole mailbox (a full refresh).
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let removed = entries.len();
        entries.clear();
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("🗑️ Cache cleared: {} entries removed", removed);
        }
        removed
    }

    /// Remove every entry whose canonical key contains `pattern`.
    pub fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            entries.pop(key);
        }

        if !matching.is_empty() {
            self.invalidations
                .fetch_add(matching.len() as u64, Ordering::Relaxed);
            debug!(
                "🗑️ Pattern invalidation '{}': {} entries removed",
                pattern,
                matching.len()
            );
        }

        matching.len()
    }

    /// Remove entries scoped to one folder
    pub fn invalidate_table(&self, folder: &str) -> usize {
        self.invalidate_by_pattern(&format!("folder={folder};"))
    }

    /// Remove entries mentioning one specific email id
    pub fn invalidate_email(&self, id: &str) -> usize {
        self.invalidate_by_pattern(&format!("id={id};"))
    }

    /// Remove all entries for one command
    pub fn invalidate_command(&self, command: &str) -> usize {
        self.invalidate_by_pattern(&format!("cmd={command};"))
    }

    /// Remove entries for one search keyword
    pub fn invalidate_search(&self, keyword: &str) -> usize {
        self.invalidate_by_pattern(&format!("keyword={keyword};"))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.len();
        CacheStats {
            entries,
            capacity: self.capacity,
            ttl_seconds: self.ttl.as_secs(),
            usage_pct: (entries as f64 / self.capacity as f64) * 100.0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}
