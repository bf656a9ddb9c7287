//! Per-key usage counters.
//!
//! Observability only: nothing in the cache reads these to make decisions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// Point-in-time usage of one cached key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    /// Reads served from the cache since the entry was written.
    pub hits: u64,
    /// Type name of the stored value.
    pub value_type: &'static str,
}

/// Usage aggregated over every key holding one value type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeUsage {
    pub items: usize,
    pub total_usage: u64,
}

impl fmt::Display for TypeUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Items: {}, TotalUsage: {}", self.items, self.total_usage)
    }
}

#[derive(Debug)]
struct UsageCounter {
    hits: AtomicU64,
    value_type: &'static str,
    generation: u64,
}

/// Concurrent key -> usage counter table.
#[derive(Debug, Default)]
pub struct UsageTable {
    counters: DashMap<String, UsageCounter>,
}

impl UsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly written entry, replacing any older counter.
    pub(crate) fn track(&self, key: &str, value_type: &'static str, generation: u64) {
        self.counters.insert(
            key.to_string(),
            UsageCounter {
                hits: AtomicU64::new(0),
                value_type,
                generation,
            },
        );
    }

    /// Count a cache hit. Keys that are not tracked are left untracked.
    pub(crate) fn record_hit(&self, key: &str) -> Option<u64> {
        self.counters
            .get(key)
            .map(|counter| counter.hits.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Stop tracking `key` if its counter belongs to `generation`.
    pub(crate) fn release(&self, key: &str, generation: u64) -> Option<UsageRecord> {
        self.counters
            .remove_if(key, |_, counter| counter.generation == generation)
            .map(|(_, counter)| UsageRecord {
                hits: counter.hits.load(Ordering::Relaxed),
                value_type: counter.value_type,
            })
    }

    pub fn get(&self, key: &str) -> Option<UsageRecord> {
        self.counters.get(key).map(|counter| UsageRecord {
            hits: counter.hits.load(Ordering::Relaxed),
            value_type: counter.value_type,
        })
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Copy of every counter at this instant.
    pub fn snapshot(&self) -> HashMap<String, UsageRecord> {
        self.counters
            .iter()
            .map(|counter| {
                (
                    counter.key().clone(),
                    UsageRecord {
                        hits: counter.hits.load(Ordering::Relaxed),
                        value_type: counter.value_type,
                    },
                )
            })
            .collect()
    }

    /// Usage grouped by value type, computed from a snapshot.
    pub fn report(&self) -> BTreeMap<&'static str, TypeUsage> {
        let mut report: BTreeMap<&'static str, TypeUsage> = BTreeMap::new();
        for record in self.snapshot().into_values() {
            let usage = report.entry(record.value_type).or_default();
            usage.items += 1;
            usage.total_usage += record.hits;
        }
        report
    }

    /// Emit the grouped report as one `info` event per value type.
    pub fn log_report(&self, instance: &str) {
        let report = self.report();
        if report.is_empty() {
            info!(instance, "Cache usage: empty");
            return;
        }

        for (value_type, usage) in report {
            info!(
                instance,
                entity = value_type,
                items = usage.items,
                total_usage = usage.total_usage,
                "Cache usage: {}",
                usage
            );
        }
    }
}
