//! Distributed invalidation relay.
//!
//! Removals performed on one instance are published as
//! [`InvalidationEvent`]s on the `CacheRelease` channel. Every instance
//! subscribes with its own id and applies received events to its local cache
//! without republishing them.

mod event;
mod receiver;
mod sender;
mod transport;

pub use event::{CHANNEL_NAME, InvalidationEvent};
pub use receiver::{InvalidationReceiver, subscription_id};
pub use sender::InvalidationSender;
pub use transport::{InMemoryBus, MessageHandler, Subscription, Transport};
