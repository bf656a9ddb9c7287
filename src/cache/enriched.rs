//! Enriched cache: Moka store + tag index + usage counters.

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, trace, warn};

use super::api::TaggedCache;
use super::config::CacheSettings;
use super::expiration::Expiration;
use super::index::TagIndex;
use super::store::{EntryStore, EvictionReason, StoredEntry};
use super::tags::Tags;
use super::usage::{TypeUsage, UsageRecord, UsageTable};

/// Shortest accepted maintenance interval.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

/// In-process cache with tag-based group invalidation.
///
/// Cloning is cheap and shares the same underlying store.
///
/// ## Example
///
/// ```rust
/// # async fn example() {
/// use enriched_cache::{CacheSettings, EnrichedCache, Expiration, Tags};
///
/// let cache = EnrichedCache::new(CacheSettings::default());
/// cache.add(
///     "user:42",
///     "Ann".to_string(),
///     Expiration::never(),
///     Tags::from([("entity", "user"), ("id", "42")]),
/// );
///
/// assert_eq!(cache.get::<String>("user:42").as_deref(), Some("Ann"));
///
/// cache.remove_by_tags(&Tags::from([("id", "42")])).await;
/// assert_eq!(cache.get::<String>("user:42"), None);
/// # }
/// ```
#[derive(Clone)]
pub struct EnrichedCache {
    inner: Arc<Inner>,
}

struct Inner {
    settings: CacheSettings,
    store: EntryStore,
    index: Arc<TagIndex>,
    usage: Arc<UsageTable>,
    next_generation: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl EnrichedCache {
    /// Create a cache with the given settings.
    ///
    /// When called inside a tokio runtime a maintenance task is started that
    /// sweeps expirations and logs usage reports until [`shutdown`](Self::shutdown).
    pub fn new(settings: CacheSettings) -> Self {
        let index = Arc::new(TagIndex::new());
        let usage = Arc::new(UsageTable::new());

        let store = {
            let index = Arc::clone(&index);
            let usage = Arc::clone(&usage);
            EntryStore::new(settings.max_capacity, move |key, entry, reason| {
                on_evicted(&index, &usage, key, &entry, reason);
            })
        };

        let inner = Arc::new(Inner {
            settings,
            store,
            index,
            usage,
            next_generation: AtomicU64::new(0),
            maintenance: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        if inner.settings.enabled {
            start_maintenance(&inner);
        }

        info!(
            instance = %inner.settings.instance_name,
            enabled = inner.settings.enabled,
            max_capacity = ?inner.settings.max_capacity,
            "Enriched cache initialized"
        );

        Self { inner }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings.enabled
    }

    /// Get a value from the cache.
    ///
    /// Returns `Some(value)` if the key is present, not expired, not
    /// invalidated by a tag, and holds a `T`. Every such read counts as a hit,
    /// whatever the value looks like.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.accepts(key) {
            return None;
        }

        let entry = self.inner.store.get(key)?;
        if entry.is_cancelled() {
            trace!(key, "Entry invalidated by tag, treating as miss");
            return None;
        }

        let Some(value) = entry.value.downcast_ref::<T>() else {
            warn!(
                key,
                stored = entry.value_type,
                requested = type_name::<T>(),
                "Cached value has a different type"
            );
            return None;
        };

        self.inner.usage.record_hit(key);
        Some(value.clone())
    }

    /// Insert a value, replacing any entry under the same key.
    ///
    /// The entry is linked to every tag before it becomes visible to readers.
    pub fn add<T>(&self, key: &str, value: T, expiration: Expiration, tags: Tags)
    where
        T: Send + Sync + 'static,
    {
        if !self.accepts(key) {
            return;
        }
        self.insert(key, Arc::new(value), type_name::<T>(), expiration, tags);
    }

    /// Get the cached value or load, store and return it.
    ///
    /// The loader runs without any cache lock held. Concurrent calls for the
    /// same absent key are not collapsed: each may run its loader.
    pub async fn get_or_add<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        expiration: Expiration,
        tags: Tags,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.accepts(key) {
            return loader().await;
        }

        if let Some(value) = self.get::<T>(key) {
            return Ok(value);
        }

        let value = loader().await?;
        self.insert(key, Arc::new(value.clone()), type_name::<T>(), expiration, tags);
        Ok(value)
    }

    /// Remove a single entry. Its eviction bookkeeping has run when this returns.
    pub async fn remove_by_key(&self, key: &str) {
        if !self.accepts(key) {
            return;
        }
        self.inner.store.invalidate(key);
        debug!(key, "Cache key removed");
    }

    /// Evict every entry linked to any of `tags`.
    pub async fn remove_by_tags(&self, tags: &Tags) {
        if !self.inner.settings.enabled {
            return;
        }
        let evicted = self.evict_tags(tags);
        debug!(tags = %tags, evicted, "Cache tags invalidated");
    }

    /// Key -> usage at this instant.
    pub fn usage_snapshot(&self) -> HashMap<String, UsageRecord> {
        self.inner.usage.snapshot()
    }

    /// Usage grouped by value type.
    pub fn usage_report(&self) -> BTreeMap<&'static str, TypeUsage> {
        self.inner.usage.report()
    }

    /// Tag name -> `"value: N linked keys"` lines.
    pub fn tag_index_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.index.snapshot()
    }

    /// Keys currently linked to one tag, `None` if the tag has no live group.
    pub fn linked_keys(&self, tag_name: &str, tag_value: &str) -> Option<Vec<String>> {
        self.inner.index.linked_keys(tag_name, tag_value)
    }

    /// Approximate number of stored entries.
    pub fn entry_count(&self) -> u64 {
        self.inner.store.entry_count()
    }

    /// Process pending expirations and evictions now.
    pub fn run_pending_tasks(&self) {
        self.inner.store.run_pending_tasks();
    }

    /// Stop the maintenance task and log a final usage report.
    ///
    /// Idempotent. Outstanding tag groups are left as they are.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn accepts(&self, key: &str) -> bool {
        self.inner.settings.enabled && !key.trim().is_empty()
    }

    fn insert(
        &self,
        key: &str,
        value: Arc<dyn Any + Send + Sync>,
        value_type: &'static str,
        expiration: Expiration,
        tags: Tags,
    ) {
        let inner = &self.inner;
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        inner.store.insert_with(key, || {
            let signals: Vec<_> = tags
                .iter()
                .map(|(name, value)| inner.index.link(name, value, key, generation))
                .collect();
            inner.usage.track(key, value_type, generation);

            StoredEntry {
                value,
                value_type,
                expiration,
                tags: Arc::new(tags),
                signals: signals.into(),
                generation,
            }
        });

        trace!(key, value_type, generation, expiration = %expiration, "Cache item added");
    }

    /// Fire and drain each tag group, then evict its members from the store.
    fn evict_tags(&self, tags: &Tags) -> usize {
        let mut evicted = 0;
        let mut pending = false;

        for (name, value) in tags.iter() {
            let Some(drained) = self.inner.index.signal_and_drain(name, value) else {
                trace!(tag_name = name, tag_value = value, "No live group for tag");
                continue;
            };

            for (key, generation) in drained.members {
                if self.inner.store.invalidate_generation(&key, generation) {
                    evicted += 1;
                } else {
                    pending = true;
                }
            }
        }

        // members not removed directly are already expired or still being
        // written; their cancelled signal makes the store expire them
        if pending {
            self.inner.store.run_pending_tasks();
        }

        evicted
    }
}

#[async_trait]
impl TaggedCache for EnrichedCache {
    fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        EnrichedCache::get(self, key)
    }

    fn add<T>(&self, key: &str, value: T, expiration: Expiration, tags: Tags)
    where
        T: Send + Sync + 'static,
    {
        EnrichedCache::add(self, key, value, expiration, tags)
    }

    async fn get_or_add<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        expiration: Expiration,
        tags: Tags,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        EnrichedCache::get_or_add(self, key, loader, expiration, tags).await
    }

    async fn remove_by_key(&self, key: &str) {
        EnrichedCache::remove_by_key(self, key).await
    }

    async fn remove_by_tags(&self, tags: &Tags) {
        EnrichedCache::remove_by_tags(self, tags).await
    }

    fn usage_snapshot(&self) -> HashMap<String, UsageRecord> {
        EnrichedCache::usage_snapshot(self)
    }

    fn tag_index_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        EnrichedCache::tag_index_snapshot(self)
    }
}

impl std::fmt::Debug for EnrichedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichedCache")
            .field("instance", &self.inner.settings.instance_name)
            .field("enabled", &self.inner.settings.enabled)
            .field("entry_count", &self.inner.store.entry_count())
            .field("tag_groups", &self.inner.index.group_count())
            .finish()
    }
}

impl Inner {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
        if self.settings.enabled {
            self.usage.log_report(&self.settings.instance_name);
        }
        info!(instance = %self.settings.instance_name, "Enriched cache shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Eviction bookkeeping, run by the store once per removed entry.
///
/// The only place that keeps the tag index and usage table in step with the
/// store, whatever removed the entry.
fn on_evicted(
    index: &TagIndex,
    usage: &UsageTable,
    key: &str,
    entry: &StoredEntry,
    reason: EvictionReason,
) {
    for (name, value) in entry.tags.iter() {
        index.unlink(name, value, key, entry.generation);
    }

    let released = usage.release(key, entry.generation);

    debug!(
        key,
        usage = released.map(|record| record.hits).unwrap_or_default(),
        entity = entry.value_type,
        reason = %reason,
        generation = entry.generation,
        "Cache item evicted"
    );
}

/// Spawn the sweep/report task on the current runtime, if there is one.
fn start_maintenance(inner: &Arc<Inner>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        info!(
            instance = %inner.settings.instance_name,
            "No tokio runtime, periodic usage reports and sweeps disabled"
        );
        return;
    };

    let report_every = inner.settings.usage_report_interval.max(MIN_MAINTENANCE_INTERVAL);
    let sweep_every = inner.settings.sweep_interval.max(MIN_MAINTENANCE_INTERVAL);
    let weak: Weak<Inner> = Arc::downgrade(inner);

    let task = runtime.spawn(async move {
        let mut report = interval_at(Instant::now() + report_every, report_every);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);

        loop {
            tokio::select! {
                _ = report.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.usage.log_report(&inner.settings.instance_name);
                }
                _ = sweep.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.store.run_pending_tasks();
                }
            }
        }
    });

    *inner.maintenance.lock() = Some(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        name: String,
    }

    fn cache() -> EnrichedCache {
        EnrichedCache::new(CacheSettings::for_instance("test"))
    }

    #[tokio::test]
    async fn test_user_scenario() {
        let cache = cache();
        let ann = User { name: "Ann".to_string() };

        cache.add(
            "user:42",
            ann.clone(),
            Expiration::never(),
            Tags::from([("entity", "user"), ("id", "42")]),
        );
        assert_eq!(cache.get::<User>("user:42"), Some(ann));

        cache.remove_by_tags(&Tags::from([("id", "42")])).await;

        assert_eq!(cache.get::<User>("user:42"), None);
        assert!(cache.tag_index_snapshot().is_empty());
        assert!(cache.usage_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_tag_eviction_cleans_other_values_of_same_name() {
        let cache = cache();
        cache.add("e1", 1u32, Expiration::never(), Tags::from([("region", "eu")]));
        cache.add(
            "e2",
            2u32,
            Expiration::never(),
            Tags::from([("region", "eu"), ("region", "us")]),
        );
        assert_eq!(
            cache.tag_index_snapshot()["region"],
            vec!["eu: 2 linked keys".to_string(), "us: 1 linked keys".to_string()]
        );

        cache.remove_by_tags(&Tags::from([("region", "eu")])).await;

        assert_eq!(cache.get::<u32>("e1"), None);
        assert_eq!(cache.get::<u32>("e2"), None);
        assert_eq!(cache.linked_keys("region", "us"), None);
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_tag_eviction_cleans_other_tags() {
        let cache = cache();
        cache.add(
            "e2",
            2u32,
            Expiration::never(),
            Tags::from([("region", "eu"), ("zone", "us")]),
        );

        cache.remove_by_tags(&Tags::from([("zone", "us")])).await;

        assert_eq!(cache.get::<u32>("e2"), None);
        assert_eq!(cache.linked_keys("region", "eu"), None);
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_usage_counts_hits_from_zero() {
        let cache = cache();
        cache.add("k", 7u64, Expiration::never(), Tags::new());

        for _ in 0..3 {
            assert_eq!(cache.get::<u64>("k"), Some(7));
        }

        let usage = cache.usage_snapshot();
        assert_eq!(usage["k"].hits, 3);
        assert_eq!(usage["k"].value_type, "u64");
    }

    #[tokio::test]
    async fn test_miss_creates_no_usage() {
        let cache = cache();
        assert_eq!(cache.get::<u64>("never-inserted"), None);
        assert!(cache.usage_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_default_value_is_a_hit() {
        let cache = cache();
        cache.add("zero", 0i32, Expiration::never(), Tags::new());
        cache.add("empty", String::new(), Expiration::never(), Tags::new());

        assert_eq!(cache.get::<i32>("zero"), Some(0));
        assert_eq!(cache.get::<String>("empty"), Some(String::new()));
        assert_eq!(cache.usage_snapshot()["zero"].hits, 1);
        assert_eq!(cache.usage_snapshot()["empty"].hits, 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_miss() {
        let cache = cache();
        cache.add("k", 7u64, Expiration::never(), Tags::new());

        assert_eq!(cache.get::<String>("k"), None);
        assert_eq!(cache.usage_snapshot()["k"].hits, 0);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_new_links() {
        let cache = cache();
        cache.add(
            "k",
            1u32,
            Expiration::never(),
            Tags::from([("shared", "x"), ("old", "y")]),
        );
        cache.get::<u32>("k");
        cache.add(
            "k",
            2u32,
            Expiration::never(),
            Tags::from([("shared", "x"), ("new", "z")]),
        );

        assert_eq!(cache.get::<u32>("k"), Some(2));
        assert_eq!(cache.linked_keys("shared", "x"), Some(vec!["k".to_string()]));
        assert_eq!(cache.linked_keys("new", "z"), Some(vec!["k".to_string()]));
        assert_eq!(cache.linked_keys("old", "y"), None);
        // the replacement starts its own counter
        assert_eq!(cache.usage_snapshot()["k"].hits, 1);

        cache.remove_by_tags(&Tags::from([("shared", "x")])).await;
        assert_eq!(cache.get::<u32>("k"), None);
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_remove_by_key_cleans_index() {
        let cache = cache();
        cache.add("k", 1u32, Expiration::never(), Tags::from([("order", "1")]));

        cache.remove_by_key("k").await;
        cache.remove_by_key("k").await;

        assert_eq!(cache.get::<u32>("k"), None);
        assert!(cache.tag_index_snapshot().is_empty());
        assert!(cache.usage_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_tag_is_noop() {
        let cache = cache();
        cache.add("k", 1u32, Expiration::never(), Tags::from([("order", "1")]));

        cache.remove_by_tags(&Tags::from([("order", "2")])).await;
        cache.remove_by_tags(&Tags::from([("order", "2")])).await;

        assert_eq!(cache.get::<u32>("k"), Some(1));
    }

    #[tokio::test]
    async fn test_expiry_cleans_index() {
        let cache = cache();
        cache.add(
            "k",
            1u32,
            Expiration::after(Duration::from_millis(20)),
            Tags::from([("order", "1")]),
        );
        assert!(cache.linked_keys("order", "1").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get::<u32>("k"), None);

        // moka's expiry timers advance in ticks of about a second
        let mut cleaned = false;
        for _ in 0..40 {
            cache.run_pending_tasks();
            if cache.tag_index_snapshot().is_empty() {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(cleaned);
        assert!(cache.usage_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_sliding_expiry_extends_on_read() {
        let cache = cache();
        cache.add(
            "k",
            1u32,
            Expiration::sliding(Duration::from_millis(200)),
            Tags::new(),
        );

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            assert_eq!(cache.get::<u32>("k"), Some(1));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[tokio::test]
    async fn test_get_or_add_loads_once_then_hits() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_add(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, std::io::Error>(5u32)
                    },
                    Expiration::never(),
                    Tags::from([("order", "1")]),
                )
                .await
                .unwrap();
            assert_eq!(value, 5);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.usage_snapshot()["k"].hits, 2);
    }

    #[tokio::test]
    async fn test_get_or_add_loader_error_stores_nothing() {
        let cache = cache();

        let result: Result<u32, &str> = cache
            .get_or_add(
                "k",
                || async { Err("database down") },
                Expiration::never(),
                Tags::from([("order", "1")]),
            )
            .await;

        assert_eq!(result, Err("database down"));
        assert_eq!(cache.get::<u32>("k"), None);
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_passthrough() {
        let cache = EnrichedCache::new(CacheSettings::disabled());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_add(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, std::io::Error>(1u8)
                    },
                    Expiration::never(),
                    Tags::from([("order", "1")]),
                )
                .await
                .unwrap();
            assert_eq!(value, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.add("k", 1u8, Expiration::never(), Tags::new());
        assert_eq!(cache.get::<u8>("k"), None);

        cache.remove_by_key("k").await;
        cache.remove_by_tags(&Tags::from([("order", "1")])).await;
        assert!(cache.usage_snapshot().is_empty());
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_blank_key_bypasses_cache() {
        let cache = cache();
        cache.add("  ", 1u8, Expiration::never(), Tags::from([("order", "1")]));

        assert_eq!(cache.get::<u8>("  "), None);
        assert!(cache.tag_index_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_eviction_cleans_index() {
        let cache = EnrichedCache::new(CacheSettings::for_instance("small").max_capacity(10));

        for i in 0..200u32 {
            cache.add(
                &format!("k{}", i),
                i,
                Expiration::never(),
                Tags::from([("batch", "all")]),
            );
        }
        for _ in 0..3 {
            cache.run_pending_tasks();
        }

        let linked = cache.linked_keys("batch", "all").map(|keys| keys.len()).unwrap_or(0);
        assert_eq!(linked as u64, cache.entry_count());
        assert_eq!(cache.usage_snapshot().len() as u64, cache.entry_count());
        assert!(cache.entry_count() <= 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_leaves_no_groups() {
        let cache = cache();

        let tasks: Vec<_> = (0..8u32)
            .map(|t| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..200u32 {
                        let key = format!("k{}", i % 20);
                        let tags = Tags::from([("worker", t.to_string()), ("shared", "x".to_string())]);
                        cache.add(&key, i, Expiration::never(), tags);
                        if i % 3 == 0 {
                            cache.remove_by_key(&key).await;
                        }
                        if i % 7 == 0 {
                            cache.remove_by_tags(&Tags::from([("worker", t.to_string())])).await;
                        }
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        cache.remove_by_tags(&Tags::from([("shared", "x")])).await;
        for _ in 0..3 {
            cache.run_pending_tasks();
        }

        assert!(cache.tag_index_snapshot().is_empty());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cache = cache();
        cache.add("k", 1u8, Expiration::never(), Tags::new());

        cache.shutdown();
        cache.shutdown();

        // the store keeps serving after shutdown
        assert_eq!(cache.get::<u8>("k"), Some(1));
    }

    #[test]
    fn test_works_without_runtime() {
        let cache = cache();
        cache.add("k", 1u8, Expiration::never(), Tags::new());
        assert_eq!(cache.get::<u8>("k"), Some(1));
    }
}
