//! The `put` policy for keys that are currently in flight.

/// Tagged variant selecting `put`'s behavior against an in-flight key. No
/// subtype hierarchy is needed for this; a plain enum matched at the top of
/// `put` is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfInFlight {
    /// Overwrite the in-flight lease's value in place. The current lease
    /// holder keeps the value it already received; the update is only
    /// observed by a subsequent `release`/reaper requeue.
    #[default]
    Update,
    /// Fail with [`crate::QueueError::KeyInFlight`].
    Reject,
    /// Append a second, independent node for this key, temporarily
    /// breaking the "key in exactly one place" invariant until the
    /// in-flight lease resolves. See Design Notes on BUFFER.
    Buffer,
}
