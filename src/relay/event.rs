//! Invalidation event and its wire format.

use serde::{Deserialize, Serialize};

use crate::cache::Tags;
use crate::error::RelayError;

/// Channel every instance publishes invalidations to.
pub const CHANNEL_NAME: &str = "CacheRelease";

/// One removal to apply on every instance: a key, or a set of tags.
///
/// On the wire this is `{"key": string|null, "tags": {name: value}|null}`
/// with exactly one of the two set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub enum InvalidationEvent {
    Key(String),
    Tags(Tags),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    tags: Option<Tags>,
}

impl InvalidationEvent {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn tags(tags: Tags) -> Self {
        Self::Tags(tags)
    }

    /// Events that together evict every pair of `tags`.
    ///
    /// The wire map holds one value per name, so a set carrying several
    /// values for a name becomes several events.
    pub fn for_tags(tags: &Tags) -> Vec<Self> {
        tags.split_by_name().into_iter().map(Self::Tags).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        let wire: WireEvent = serde_json::from_slice(payload)?;
        Self::try_from(wire)
    }
}

impl TryFrom<WireEvent> for InvalidationEvent {
    type Error = RelayError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let key = wire.key.filter(|key| !key.trim().is_empty());
        let tags = wire.tags.filter(|tags| !tags.is_empty());

        match (key, tags) {
            (Some(key), None) => Ok(Self::Key(key)),
            (None, Some(tags)) => Ok(Self::Tags(tags)),
            (Some(_), Some(_)) => Err(RelayError::MalformedEvent(
                "both key and tags are set".to_string(),
            )),
            (None, None) => Err(RelayError::MalformedEvent(
                "neither key nor tags is set".to_string(),
            )),
        }
    }
}

impl From<InvalidationEvent> for WireEvent {
    fn from(event: InvalidationEvent) -> Self {
        match event {
            InvalidationEvent::Key(key) => Self {
                key: Some(key),
                tags: None,
            },
            InvalidationEvent::Tags(tags) => Self {
                key: None,
                tags: Some(tags),
            },
        }
    }
}
