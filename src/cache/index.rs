//! Tag index: `tag name -> tag value -> invalidation group`.
//!
//! Each group owns the cancellation signal shared by every entry tagged with
//! its `(name, value)` pair, plus the live set of keys linked to it. Groups are
//! created on first link and removed as soon as their key set empties, so the
//! index never accumulates dead groups as the cache churns.
//!
//! Locking is scoped to dashmap shards: the outer map is only locked for
//! reading while a group is linked or unlinked, and for writing when an empty
//! tag name is pruned. Lock order is always outer then inner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::{debug, trace};

/// One-shot fan-out signal shared by all entries of an invalidation group.
///
/// The store observes it through the entry expiry adapter: an entry holding a
/// fired signal is treated as expired.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Keys currently linked to one `(name, value)` pair.
///
/// Members map a key to the generation of the entry that linked it, so that
/// the eviction of a replaced entry never unlinks its replacement.
#[derive(Debug)]
struct InvalidationGroup {
    signal: Arc<CancellationSignal>,
    members: HashMap<String, u64>,
}

impl InvalidationGroup {
    fn new() -> Self {
        Self {
            signal: Arc::new(CancellationSignal::new()),
            members: HashMap::new(),
        }
    }
}

/// Members evicted from a drained group.
#[derive(Debug, Default)]
pub(crate) struct DrainedGroup {
    pub members: Vec<(String, u64)>,
}

/// Concurrent two-level index of invalidation groups.
#[derive(Debug, Default)]
pub struct TagIndex {
    groups: DashMap<String, DashMap<String, InvalidationGroup>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `key` (at `generation`) to the group for `(tag_name, tag_value)`,
    /// creating the group if needed, and return the group's signal.
    ///
    /// Get-or-create and membership insert happen under the same shard lock,
    /// so a concurrent unlink can never retire the group in between.
    pub(crate) fn link(
        &self,
        tag_name: &str,
        tag_value: &str,
        key: &str,
        generation: u64,
    ) -> Arc<CancellationSignal> {
        let values = self
            .groups
            .entry(tag_name.to_string())
            .or_default()
            .downgrade();

        let mut group = values
            .entry(tag_value.to_string())
            .or_insert_with(InvalidationGroup::new);
        group.members.insert(key.to_string(), generation);

        trace!(tag_name, tag_value, key, generation, "Linked cache key to tag");
        Arc::clone(&group.signal)
    }

    /// Remove `key` from the group if it is still linked at `generation`.
    ///
    /// Retires the group once it is empty, and the tag name once it has no
    /// groups left. Absent pairs and keys are a no-op.
    pub(crate) fn unlink(&self, tag_name: &str, tag_value: &str, key: &str, generation: u64) -> bool {
        let Some(values) = self.groups.get(tag_name) else {
            trace!(tag_name, tag_value, key, "Tag already retired");
            return false;
        };

        let (unlinked, now_empty) = match values.get_mut(tag_value) {
            Some(mut group) => {
                let unlinked = match group.members.get(key).copied() {
                    Some(linked) if linked == generation => {
                        group.members.remove(key);
                        true
                    }
                    Some(linked) => {
                        debug!(
                            tag_name,
                            tag_value,
                            key,
                            generation,
                            linked_generation = linked,
                            "Key relinked by a newer entry, keeping link"
                        );
                        false
                    }
                    None => {
                        debug!(tag_name, tag_value, key, "Key not linked to tag group");
                        false
                    }
                };
                (unlinked, group.members.is_empty())
            }
            None => (false, false),
        };

        if now_empty {
            values.remove_if(tag_value, |_, group| group.members.is_empty());
        }
        drop(values);

        self.prune(tag_name);
        unlinked
    }

    /// Fire the signal of `(tag_name, tag_value)` and retire the group at once.
    ///
    /// Returns the members that were linked so the caller can evict them from
    /// the store. Returns `None` if no such group exists.
    pub(crate) fn signal_and_drain(&self, tag_name: &str, tag_value: &str) -> Option<DrainedGroup> {
        let removed = {
            let values = self.groups.get(tag_name)?;
            values.remove(tag_value).map(|(_, group)| group)
        };
        self.prune(tag_name);

        let group = removed?;
        group.signal.cancel();

        Some(DrainedGroup {
            members: group.members.into_iter().collect(),
        })
    }

    /// Keys linked to `(tag_name, tag_value)`, `None` when no group exists.
    pub fn linked_keys(&self, tag_name: &str, tag_value: &str) -> Option<Vec<String>> {
        let values = self.groups.get(tag_name)?;
        let group = values.get(tag_value)?;
        let mut keys: Vec<String> = group.members.keys().cloned().collect();
        keys.sort();
        Some(keys)
    }

    /// Diagnostic dump: tag name -> `"value: N linked keys"`.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.groups
            .iter()
            .filter_map(|values| {
                let mut lines: Vec<String> = values
                    .iter()
                    .map(|group| format!("{}: {} linked keys", group.key(), group.members.len()))
                    .collect();
                if lines.is_empty() {
                    return None;
                }
                lines.sort();
                Some((values.key().clone(), lines))
            })
            .collect()
    }

    /// Number of live groups across all tag names.
    pub fn group_count(&self) -> usize {
        self.groups.iter().map(|values| values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.group_count() == 0
    }

    fn prune(&self, tag_name: &str) {
        self.groups.remove_if(tag_name, |_, values| values.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_shares_one_signal_per_pair() {
        let index = TagIndex::new();

        let a = index.link("region", "eu", "k1", 1);
        let b = index.link("region", "eu", "k2", 2);
        let c = index.link("region", "us", "k2", 2);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(index.group_count(), 2);
        assert_eq!(
            index.linked_keys("region", "eu"),
            Some(vec!["k1".to_string(), "k2".to_string()])
        );
    }

    #[test]
    fn test_unlink_last_key_retires_group() {
        let index = TagIndex::new();
        index.link("order", "42", "k1", 1);

        assert!(index.unlink("order", "42", "k1", 1));
        assert!(index.is_empty());
        assert!(index.snapshot().is_empty());
    }

    #[test]
    fn test_unlink_absent_is_noop() {
        let index = TagIndex::new();
        assert!(!index.unlink("order", "42", "k1", 1));

        index.link("order", "42", "k1", 1);
        assert!(!index.unlink("order", "42", "other", 1));
        assert!(!index.unlink("order", "43", "k1", 1));
        assert_eq!(index.group_count(), 1);
    }

    #[test]
    fn test_unlink_stale_generation_keeps_link() {
        let index = TagIndex::new();
        index.link("order", "42", "k1", 1);
        index.link("order", "42", "k1", 2);

        assert!(!index.unlink("order", "42", "k1", 1));
        assert_eq!(index.linked_keys("order", "42"), Some(vec!["k1".to_string()]));

        assert!(index.unlink("order", "42", "k1", 2));
        assert!(index.is_empty());
    }

    #[test]
    fn test_signal_and_drain_fires_and_retires() {
        let index = TagIndex::new();
        let signal = index.link("order", "42", "k1", 1);
        index.link("order", "42", "k2", 2);

        let drained = index.signal_and_drain("order", "42").unwrap();

        assert!(signal.is_cancelled());
        assert_eq!(drained.members.len(), 2);
        assert!(index.is_empty());

        // the signal of a new group for the same pair starts fresh
        let fresh = index.link("order", "42", "k1", 3);
        assert!(!fresh.is_cancelled());
    }

    #[test]
    fn test_signal_and_drain_missing_pair() {
        let index = TagIndex::new();
        assert!(index.signal_and_drain("order", "42").is_none());
    }

    #[test]
    fn test_snapshot_format() {
        let index = TagIndex::new();
        index.link("region", "eu", "k1", 1);
        index.link("region", "eu", "k2", 2);
        index.link("entity", "user", "k1", 1);

        let snapshot = index.snapshot();
        assert_eq!(snapshot["region"], vec!["eu: 2 linked keys".to_string()]);
        assert_eq!(snapshot["entity"], vec!["user: 1 linked keys".to_string()]);
    }

    #[test]
    fn test_cancel_fires_once() {
        let signal = CancellationSignal::new();
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_concurrent_link_unlink_leaves_no_garbage() {
        let index = Arc::new(TagIndex::new());

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = format!("k{}-{}", t, i);
                        let generation = t * 1_000 + i;
                        index.link("shared", "v", &key, generation);
                        index.link("own", &t.to_string(), &key, generation);
                        index.unlink("shared", "v", &key, generation);
                        index.unlink("own", &t.to_string(), &key, generation);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(index.is_empty());
        assert!(index.snapshot().is_empty());
    }
}
