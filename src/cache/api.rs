//! The contract shared by the local and the distributed cache.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use async_trait::async_trait;

use super::expiration::Expiration;
use super::tags::Tags;
use super::usage::UsageRecord;

/// Tag-aware object cache.
///
/// Callers written against this trait work unchanged whether invalidation
/// stays in-process ([`EnrichedCache`](super::EnrichedCache)) or is relayed
/// to the fleet ([`DistributedEnrichedCache`](crate::DistributedEnrichedCache)).
///
/// Concurrent `get_or_add` calls for the same absent key may each run their
/// loader; the last write observed by the store wins. No ordering is promised
/// between an `add` and a `remove_by_tags` racing on the same tag.
#[async_trait]
pub trait TaggedCache: Send + Sync {
    /// Cached value for `key`, counting a hit. Absent keys return `None`.
    fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static;

    /// Store `value` under `key`, replacing any existing entry.
    fn add<T>(&self, key: &str, value: T, expiration: Expiration, tags: Tags)
    where
        T: Send + Sync + 'static;

    /// Cached value for `key`, or the loader's value which is then stored.
    ///
    /// Loader errors are returned as-is and nothing is stored.
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
        Fut: Future<Output = Result<T, E>> + Send;

    /// Remove one entry. Missing keys are a no-op.
    async fn remove_by_key(&self, key: &str);

    /// Evict every entry linked to any of the given tags.
    async fn remove_by_tags(&self, tags: &Tags);

    /// Key -> usage at this instant.
    fn usage_snapshot(&self) -> HashMap<String, UsageRecord>;

    /// Tag name -> `"value: N linked keys"` lines.
    fn tag_index_snapshot(&self) -> BTreeMap<String, Vec<String>>;
}
