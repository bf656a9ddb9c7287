//! Error types for the cache and its invalidation relay.
//!
//! Nothing here ever reaches a cache caller: transport and relay failures are
//! logged at the relay boundary. Only a `get_or_add` loader's own error is
//! returned to the consumer.

use thiserror::Error;

/// Publish/subscribe transport failure.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Subscribing requires a running async runtime.
    #[error("No async runtime available to run subscription `{0}`")]
    NoRuntime(String),

    /// Backend-specific failure.
    #[error("Transport error: {0}")]
    Backend(String),
}

/// Failure to encode, decode or deliver an invalidation event.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload decoded but does not describe exactly one removal.
    #[error("Malformed invalidation event: {0}")]
    MalformedEvent(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invalid configuration value.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}
