//! Publishing side of the invalidation relay.

use std::sync::Arc;

use tracing::{debug, error};

use super::event::{CHANNEL_NAME, InvalidationEvent};
use super::transport::Transport;
use crate::error::RelayError;

/// Publishes invalidation events to the fleet.
#[derive(Clone)]
pub struct InvalidationSender {
    transport: Arc<dyn Transport>,
    channel: String,
}

impl InvalidationSender {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_channel(transport, CHANNEL_NAME)
    }

    pub fn with_channel(transport: Arc<dyn Transport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, event: &InvalidationEvent) -> Result<(), RelayError> {
        let payload = event.encode()?;
        self.transport.publish(&self.channel, payload).await?;
        debug!(channel = %self.channel, ?event, "Invalidation published");
        Ok(())
    }

    /// Publish, logging instead of returning failures.
    ///
    /// Local state has already changed by the time this runs, so a failed
    /// publish only leaves peers stale until their entries expire.
    pub async fn publish_best_effort(&self, event: &InvalidationEvent) {
        if let Err(e) = self.publish(event).await {
            error!(
                channel = %self.channel,
                ?event,
                error = %e,
                "Failed to publish cache invalidation"
            );
        }
    }
}

impl std::fmt::Debug for InvalidationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationSender")
            .field("channel", &self.channel)
            .finish()
    }
}
