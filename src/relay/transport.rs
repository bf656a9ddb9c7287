//! Publish/subscribe transport seam and an in-process implementation.
//!
//! A transport moves opaque payloads between instances. Every distinct
//! subscription id on a channel receives every message published to it;
//! subscribing again with an id that is already active replaces the earlier
//! handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Default per-channel buffer of the in-memory bus.
/// Subscribers falling further behind lose the oldest messages.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Receives the payloads delivered to one subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]);
}

/// Fan-out message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `payload` to every subscription on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Start delivering messages on `channel` to `handler`.
    ///
    /// Delivery stops when the returned [`Subscription`] is dropped.
    async fn subscribe(
        &self,
        channel: &str,
        subscription_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError>;
}

/// Handle to an active subscription.
pub struct Subscription {
    channel: String,
    subscription_id: String,
    task: Option<AbortHandle>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Subscription backed by a delivery task, aborted on drop.
    pub fn new(
        channel: impl Into<String>,
        subscription_id: impl Into<String>,
        task: AbortHandle,
    ) -> Self {
        Self {
            channel: channel.into(),
            subscription_id: subscription_id.into(),
            task: Some(task),
            on_stop: None,
        }
    }

    /// Subscription whose lifetime the transport manages itself.
    pub fn detached(channel: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            subscription_id: subscription_id.into(),
            task: None,
            on_stop: None,
        }
    }

    /// Run `cleanup` once when the subscription stops.
    #[must_use]
    pub fn on_stop(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(cleanup));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Stop delivery now.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(
                channel = %self.channel,
                subscription_id = %self.subscription_id,
                "Subscription stopped"
            );
        }
        if let Some(cleanup) = self.on_stop.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("subscription_id", &self.subscription_id)
            .field("active", &self.task.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// In-process transport over tokio broadcast channels.
///
/// Cloning shares the same bus, so several caches in one process (or one
/// test) can exchange invalidations through it.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<Arc<[u8]>>>,
    /// `(channel, subscription id)` -> (token, delivery task).
    /// The token tells a stopping subscription whether the slot is still its own.
    subscriptions: DashMap<(String, String), (u64, AbortHandle)>,
    next_token: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus with a custom per-channel buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                channels: DashMap::new(),
                subscriptions: DashMap::new(),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Number of live receivers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of active subscriptions across all channels.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<[u8]>> {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("channels", &self.inner.channels.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // No receivers is not an error: nobody needs the message.
        let delivered = self.sender(channel).send(payload.into()).unwrap_or_default();
        trace!(channel, delivered, "Message published");
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        subscription_id: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::NoRuntime(subscription_id.to_string()))?;

        // Receiver exists before this call returns, so later publishes are seen.
        let mut receiver = self.sender(channel).subscribe();

        let task_channel = channel.to_string();
        let task_id = subscription_id.to_string();
        let task = runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => handler.handle(&payload).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            channel = %task_channel,
                            subscription_id = %task_id,
                            skipped,
                            "Subscriber lagged, messages dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let abort = task.abort_handle();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let slot = (channel.to_string(), subscription_id.to_string());

        let replaced = self
            .inner
            .subscriptions
            .insert(slot.clone(), (token, abort.clone()));
        if let Some((_, previous)) = replaced {
            previous.abort();
            debug!(channel, subscription_id, "Replaced existing subscription");
        }

        debug!(channel, subscription_id, "Subscribed");

        let bus = Arc::downgrade(&self.inner);
        Ok(
            Subscription::new(channel, subscription_id, abort).on_stop(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.subscriptions
                        .remove_if(&slot, |_, (current, _)| *current == token);
                }
            }),
        )
    }
}
