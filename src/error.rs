//! The closed error taxonomy surfaced to callers. No operation partially
//! mutates state and then fails: every public method either completes and
//! notifies, or returns one of these variants with queue state untouched.

/// Failure modes of [`crate::LeasedQueue`] operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `put` with [`crate::IfInFlight::Reject`] targeted a key that is
    /// currently in flight.
    #[error("key is in flight")]
    KeyInFlight,
    /// The lease token is not present in `in_flight` (unknown, already
    /// `ack`'d/`release`'d, or reaped).
    #[error("lease token is not in flight")]
    InvalidLease,
    /// The token was in `in_flight` at entry but had already been marked
    /// acknowledged, racing a concurrent reaper expiry.
    #[error("lease was already acknowledged")]
    AlreadyAcknowledged,
    /// The waited-for predicate did not become true within `wait_timeout`.
    #[error("timed out waiting for predicate")]
    Timeout,
    /// The queue was closed at entry, or closed while the operation waited.
    #[error("queue is closed")]
    Closed,
}
