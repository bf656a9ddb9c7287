//! Entry expiration policy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// How long a cached entry lives.
///
/// Absolute and sliding expiration are mutually exclusive. An entry with
/// [`Expiration::Never`] lives until it is removed explicitly, invalidated by
/// one of its tags, or evicted by the store for capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// No time-based expiry.
    #[default]
    Never,

    /// Expire at a fixed wall-clock time.
    At(DateTime<Utc>),

    /// Expire a fixed duration after the entry is written.
    After(Duration),

    /// Expire after this much inactivity. Every read resets the window.
    Sliding(Duration),
}

impl Expiration {
    pub fn never() -> Self {
        Self::Never
    }

    pub fn at(deadline: DateTime<Utc>) -> Self {
        Self::At(deadline)
    }

    pub fn after(ttl: Duration) -> Self {
        Self::After(ttl)
    }

    pub fn sliding(idle: Duration) -> Self {
        Self::Sliding(idle)
    }

    /// Lifetime of a freshly written entry, `None` when it never expires.
    ///
    /// A deadline already in the past yields a zero lifetime.
    pub(crate) fn time_to_live(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::At(deadline) => Some((*deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
            Self::After(ttl) => Some(*ttl),
            Self::Sliding(idle) => Some(*idle),
        }
    }

    /// Remaining lifetime after a read, given what was left before it.
    pub(crate) fn after_read(&self, remaining: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Sliding(idle) => Some(*idle),
            _ => remaining,
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::At(deadline) => write!(f, "at {}", deadline.to_rfc3339()),
            Self::After(ttl) => write!(f, "after {}s", ttl.as_secs_f64()),
            Self::Sliding(idle) => write!(f, "sliding {}s", idle.as_secs_f64()),
        }
    }
}
