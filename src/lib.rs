//! An in-memory, single-process keyed leased queue.
//!
//! [`LeasedQueue`] behaves simultaneously as a FIFO queue, a keyed map, and
//! a lease-based work-distribution primitive: producers insert or update
//! items by key with [`LeasedQueue::put`]; consumers either pull the oldest
//! available item with [`LeasedQueue::get`] or block on a specific key with
//! [`LeasedQueue::take`]. Every pull hands back an exclusive [`LeaseToken`]
//! that must be resolved with [`LeasedQueue::ack`] (permanent removal) or
//! [`LeasedQueue::release`] (re-enqueue); an optional background reaper
//! auto-releases leases that run past their timeout.
//!
//! The queue targets a single cooperative scheduler (an async runtime, not
//! preemptive OS threads) and makes no cross-process or distributed
//! durability claims.

mod error;
mod lease;
mod list;
mod policy;
mod queue;

pub use error::QueueError;
pub use lease::LeaseToken;
pub use policy::IfInFlight;
pub use queue::{LeasedQueue, QueueOptions, DEFAULT_REAPER_INTERVAL};
