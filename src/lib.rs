//! Enriched Cache - tag-indexed in-process cache with fleet-wide invalidation.
//!
//! ## Architecture
//!
//! - `cache` - Moka-backed object cache with tag groups, expiration policies
//!   and per-key usage tracking
//! - `relay` - Invalidation events, the pub/sub transport seam and the
//!   in-process bus
//! - `distributed` - Cache that relays its removals to every instance
//! - `config` - Environment configuration
//! - `error` - Relay, transport and configuration errors

pub mod cache;
pub mod config;
pub mod distributed;
pub mod error;
pub mod relay;
mod utils;

pub use cache::{
    CacheSettings, EnrichedCache, EvictionReason, Expiration, Tag, TaggedCache, Tags, TypeUsage,
    UsageRecord,
};
pub use config::Config;
pub use distributed::DistributedEnrichedCache;
pub use error::{ConfigError, RelayError, TransportError};
pub use relay::{InMemoryBus, InvalidationEvent, Transport};
