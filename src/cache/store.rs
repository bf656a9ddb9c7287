//! Entry store over Moka.
//!
//! Moka provides the single-process key/value store: per-entry expiry through
//! [`EntryExpiry`], capacity eviction, and an eviction listener that fires
//! exactly once per removed entry.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;

use super::expiration::Expiration;
use super::index::CancellationSignal;
use super::tags::Tags;

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Removed by key.
    Removed,
    /// Overwritten by a newer entry under the same key.
    Replaced,
    /// Evicted because one of its tags was invalidated.
    TagInvalidated,
    /// Absolute or sliding expiration elapsed.
    Expired,
    /// Evicted by the store to stay within capacity.
    Capacity,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Removed => write!(f, "removed"),
            EvictionReason::Replaced => write!(f, "replaced"),
            EvictionReason::TagInvalidated => write!(f, "tag_invalidated"),
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Capacity => write!(f, "capacity"),
        }
    }
}

/// A value as held by the store, with everything its eviction needs.
///
/// Tags and signals are captured at insertion time and never change.
#[derive(Clone)]
pub(crate) struct StoredEntry {
    pub value: Arc<dyn Any + Send + Sync>,
    pub value_type: &'static str,
    pub expiration: Expiration,
    pub tags: Arc<Tags>,
    pub signals: Arc<[Arc<CancellationSignal>]>,
    pub generation: u64,
}

impl StoredEntry {
    /// Whether any of the entry's tag groups has been invalidated.
    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|signal| signal.is_cancelled())
    }

    fn reason(&self, cause: RemovalCause) -> EvictionReason {
        match cause {
            RemovalCause::Replaced => EvictionReason::Replaced,
            RemovalCause::Size => EvictionReason::Capacity,
            _ if self.is_cancelled() => EvictionReason::TagInvalidated,
            RemovalCause::Expired => EvictionReason::Expired,
            _ => EvictionReason::Removed,
        }
    }
}

impl fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredEntry")
            .field("value_type", &self.value_type)
            .field("expiration", &self.expiration)
            .field("tags", &self.tags)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-entry expiry: follows the entry's [`Expiration`], and collapses the
/// remaining lifetime to zero once a tag signal has fired.
struct EntryExpiry;

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        if entry.is_cancelled() {
            return Some(Duration::ZERO);
        }
        entry.expiration.time_to_live()
    }

    fn expire_after_read(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if entry.is_cancelled() {
            return Some(Duration::ZERO);
        }
        entry.expiration.after_read(duration_until_expiry)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // an overwrite starts the new entry's own lifetime
        if entry.is_cancelled() {
            return Some(Duration::ZERO);
        }
        entry.expiration.time_to_live()
    }
}

/// Thin wrapper giving the cache the store operations it needs.
#[derive(Clone)]
pub(crate) struct EntryStore {
    inner: Cache<String, StoredEntry>,
}

impl EntryStore {
    /// Build the store. `on_evict` runs once for every entry that leaves it.
    pub fn new<F>(max_capacity: Option<u64>, on_evict: F) -> Self
    where
        F: Fn(&str, StoredEntry, EvictionReason) + Send + Sync + 'static,
    {
        let mut builder = Cache::<String, StoredEntry>::builder()
            .expire_after(EntryExpiry)
            .eviction_listener(move |key: Arc<String>, entry: StoredEntry, cause| {
                let reason = entry.reason(cause);
                on_evict(&key, entry, reason);
            });

        if let Some(max_capacity) = max_capacity {
            builder = builder.max_capacity(max_capacity);
        }

        Self {
            inner: builder.build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredEntry> {
        self.inner.get(key)
    }

    /// Store the entry built by `make_entry` under `key`.
    ///
    /// `make_entry` runs serialized with every other write to the same key,
    /// so bookkeeping done inside it happens in the same order the store
    /// observes the writes.
    pub fn insert_with<F>(&self, key: &str, make_entry: F)
    where
        F: FnOnce() -> StoredEntry,
    {
        self.inner
            .entry_by_ref(key)
            .and_compute_with(|_| Op::Put(make_entry()));
    }

    /// Remove whatever entry is stored under `key`.
    pub fn invalidate(&self, key: &str) {
        self.inner.invalidate(key);
    }

    /// Remove the entry under `key` only if it is the given generation.
    pub fn invalidate_generation(&self, key: &str, generation: u64) -> bool {
        let result = self
            .inner
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(entry) if entry.value().generation == generation => Op::Remove,
                _ => Op::Nop,
            });
        matches!(result, CompResult::Removed(_))
    }

    /// Process pending expirations and evictions now.
    pub fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
