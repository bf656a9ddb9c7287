//! Enriched cache whose removals are relayed to every instance.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::cache::{CacheSettings, EnrichedCache, Expiration, TaggedCache, Tags, UsageRecord};
use crate::relay::{
    CHANNEL_NAME, InvalidationEvent, InvalidationReceiver, InvalidationSender, Subscription,
    Transport, subscription_id,
};

/// [`EnrichedCache`] that publishes `remove_by_key` / `remove_by_tags` to the
/// fleet and applies the removals published by other instances.
///
/// Reads and writes stay local. A removal is applied locally first and then
/// published; a failed publish is logged and never reaches the caller.
#[derive(Clone)]
pub struct DistributedEnrichedCache {
    inner: Arc<DistributedInner>,
}

struct DistributedInner {
    cache: EnrichedCache,
    sender: InvalidationSender,
    subscription: Mutex<Option<Subscription>>,
}

impl DistributedEnrichedCache {
    /// Create a cache for `settings` and join the relay over `transport`.
    pub async fn connect(settings: CacheSettings, transport: Arc<dyn Transport>) -> Self {
        Self::with_cache(EnrichedCache::new(settings), transport).await
    }

    /// Join the relay with an existing local cache.
    ///
    /// If subscribing fails the cache keeps working with local-only
    /// invalidation and still publishes its own removals.
    pub async fn with_cache(cache: EnrichedCache, transport: Arc<dyn Transport>) -> Self {
        let instance = cache.settings().instance_name.clone();

        let subscription = if cache.is_enabled() {
            match InvalidationReceiver::new(cache.clone())
                .subscribe(transport.as_ref())
                .await
            {
                Ok(subscription) => {
                    info!(
                        instance = %instance,
                        channel = CHANNEL_NAME,
                        subscription_id = %subscription.subscription_id(),
                        "Cache invalidation relay connected"
                    );
                    Some(subscription)
                }
                Err(e) => {
                    error!(
                        instance = %instance,
                        subscription_id = %subscription_id(&instance),
                        error = %e,
                        "Failed to subscribe to cache invalidations, continuing with local invalidation only"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            inner: Arc::new(DistributedInner {
                cache,
                sender: InvalidationSender::new(transport),
                subscription: Mutex::new(subscription),
            }),
        }
    }

    /// The local cache.
    pub fn local(&self) -> &EnrichedCache {
        &self.inner.cache
    }

    /// Whether relayed events from other instances are being received.
    pub fn is_relaying(&self) -> bool {
        self.inner.subscription.lock().is_some()
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.cache.get(key)
    }

    pub fn add<T>(&self, key: &str, value: T, expiration: Expiration, tags: Tags)
    where
        T: Send + Sync + 'static,
    {
        self.inner.cache.add(key, value, expiration, tags);
    }

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
        self.inner
            .cache
            .get_or_add(key, loader, expiration, tags)
            .await
    }

    /// Remove `key` here, then tell every other instance to remove it.
    pub async fn remove_by_key(&self, key: &str) {
        let cache = &self.inner.cache;
        cache.remove_by_key(key).await;

        if cache.is_enabled() && !key.trim().is_empty() {
            self.inner
                .sender
                .publish_best_effort(&InvalidationEvent::key(key))
                .await;
        }
    }

    /// Evict `tags` here, then tell every other instance to evict them.
    pub async fn remove_by_tags(&self, tags: &Tags) {
        let cache = &self.inner.cache;
        cache.remove_by_tags(tags).await;

        if cache.is_enabled() {
            for event in InvalidationEvent::for_tags(tags) {
                self.inner.sender.publish_best_effort(&event).await;
            }
        }
    }

    pub fn usage_snapshot(&self) -> HashMap<String, UsageRecord> {
        self.inner.cache.usage_snapshot()
    }

    pub fn tag_index_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.cache.tag_index_snapshot()
    }

    /// Leave the relay and shut the local cache down. Idempotent.
    pub fn shutdown(&self) {
        if let Some(subscription) = self.inner.subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.inner.cache.shutdown();
    }
}

#[async_trait]
impl TaggedCache for DistributedEnrichedCache {
    fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        DistributedEnrichedCache::get(self, key)
    }

    fn add<T>(&self, key: &str, value: T, expiration: Expiration, tags: Tags)
    where
        T: Send + Sync + 'static,
    {
        DistributedEnrichedCache::add(self, key, value, expiration, tags);
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
        DistributedEnrichedCache::get_or_add(self, key, loader, expiration, tags).await
    }

    async fn remove_by_key(&self, key: &str) {
        DistributedEnrichedCache::remove_by_key(self, key).await;
    }

    async fn remove_by_tags(&self, tags: &Tags) {
        DistributedEnrichedCache::remove_by_tags(self, tags).await;
    }

    fn usage_snapshot(&self) -> HashMap<String, UsageRecord> {
        DistributedEnrichedCache::usage_snapshot(self)
    }

    fn tag_index_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        DistributedEnrichedCache::tag_index_snapshot(self)
    }
}

impl std::fmt::Debug for DistributedEnrichedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedEnrichedCache")
            .field("cache", &self.inner.cache)
            .field("sender", &self.inner.sender)
            .field("relaying", &self.is_relaying())
            .finish()
    }
}
