//! Cache module - tag-indexed object cache built on Moka.
//!
//! ## Architecture
//!
//! - `EntryStore` - Moka store holding type-erased values and their expiration
//! - `TagIndex` - tag name -> tag value -> invalidation group of linked keys
//! - `UsageTable` - per-key hit counters, aggregated by value type for reports
//! - `EnrichedCache` - ties the three together and keeps them consistent
//!
//! Every entry is linked into one invalidation group per tag. Evicting a tag
//! cancels its group, which removes every linked entry; whatever removes an
//! entry (explicit removal, tag eviction, expiry or capacity) also unlinks it
//! from every group and releases its usage record.
//!
//! ## Usage
//!
//! ```rust
//! use enriched_cache::{CacheSettings, EnrichedCache, Expiration, Tags};
//!
//! # async fn example() {
//! let cache = EnrichedCache::new(CacheSettings::for_instance("web-1"));
//!
//! cache.add("user:42", "Ada".to_string(), Expiration::never(), Tags::from([("id", "42")]));
//! let name: Option<String> = cache.get("user:42");
//!
//! cache.remove_by_tags(&Tags::from([("id", "42")])).await;
//! # }
//! ```

mod api;
mod config;
mod enriched;
mod expiration;
mod index;
mod store;
mod tags;
mod usage;

pub use api::TaggedCache;
pub use config::{CacheSettings, DEFAULT_SWEEP_INTERVAL, DEFAULT_USAGE_REPORT_INTERVAL};
pub use enriched::EnrichedCache;
pub use expiration::Expiration;
pub use index::{CancellationSignal, TagIndex};
pub use store::EvictionReason;
pub use tags::{Tag, Tags};
pub use usage::{TypeUsage, UsageRecord, UsageTable};
