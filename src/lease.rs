//! Lease tokens and records.

use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// An immutable, globally unique handle to an in-flight item. Produced by
/// `get`/`take`, consumed by `ack`/`release`. Equality and hashing are by
/// the underlying token value only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal per-lease bookkeeping. Created on `get`/`take`, destroyed on
/// `ack`, `release`, or reaper expiry.
pub(crate) struct LeaseRecord<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) created_at: Instant,
    pub(crate) timeout: Option<Duration>,
    pub(crate) acknowledged: bool,
}

impl<K, V> LeaseRecord<K, V> {
    pub(crate) fn new(key: K, value: V, timeout: Option<Duration>) -> Self {
        Self {
            key,
            value,
            created_at: Instant::now(),
            timeout,
            acknowledged: false,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.created_at) >= timeout,
            None => false,
        }
    }
}
