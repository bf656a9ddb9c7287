//! Receiving side of the invalidation relay.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::event::{CHANNEL_NAME, InvalidationEvent};
use super::transport::{MessageHandler, Subscription, Transport};
use crate::cache::EnrichedCache;
use crate::error::TransportError;

/// Subscription id for an instance. Unique per instance so that every
/// instance receives every event.
pub fn subscription_id(instance_name: &str) -> String {
    format!("cachereleaser_{}", instance_name)
}

/// Applies relayed invalidations to the local cache only.
///
/// Never republishes, so an event is applied once per instance.
#[derive(Debug, Clone)]
pub struct InvalidationReceiver {
    cache: EnrichedCache,
}

impl InvalidationReceiver {
    pub fn new(cache: EnrichedCache) -> Self {
        Self { cache }
    }

    pub async fn apply(&self, event: InvalidationEvent) {
        debug!(
            instance = %self.cache.settings().instance_name,
            ?event,
            "Applying relayed invalidation"
        );
        match event {
            InvalidationEvent::Key(key) => self.cache.remove_by_key(&key).await,
            InvalidationEvent::Tags(tags) => self.cache.remove_by_tags(&tags).await,
        }
    }

    /// Subscribe this receiver under the instance's subscription id.
    pub async fn subscribe(
        self,
        transport: &dyn Transport,
    ) -> Result<Subscription, TransportError> {
        let id = subscription_id(&self.cache.settings().instance_name);
        transport.subscribe(CHANNEL_NAME, &id, Arc::new(self)).await
    }
}

#[async_trait]
impl MessageHandler for InvalidationReceiver {
    async fn handle(&self, payload: &[u8]) {
        match InvalidationEvent::decode(payload) {
            Ok(event) => self.apply(event).await,
            Err(e) => {
                warn!(
                    instance = %self.cache.settings().instance_name,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Ignoring malformed invalidation message"
                );
            }
        }
    }
}
