//! The queue core: state machine over `available`, `in_flight`,
//! `leases_by_key`, and the ordered list, plus the timeout reaper and
//! lifecycle entry points.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::QueueError;
use crate::lease::{LeaseRecord, LeaseToken};
use crate::list::{List, NodeId};
use crate::policy::IfInFlight;

/// Scan interval of the background reaper.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_millis(100);

/// Construction options for a [`LeasedQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Applied to a lease when `get`/`take` don't specify their own
    /// `lease_timeout`. `None` means leases never expire on their own.
    pub default_lease_timeout: Option<Duration>,
    /// How often the reaper scans `in_flight` for expired leases. Only
    /// matters when `default_lease_timeout` is set, since the reaper is
    /// armed only then.
    pub reaper_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_lease_timeout: None,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

struct State<K, V> {
    list: List<K, V>,
    available: HashMap<K, NodeId>,
    in_flight: HashMap<LeaseToken, LeaseRecord<K, V>>,
    leases_by_key: HashMap<K, LeaseToken>,
    closed: bool,
}

impl<K: Eq + Hash + Clone, V> State<K, V> {
    fn new() -> Self {
        Self {
            list: List::new(),
            available: HashMap::new(),
            in_flight: HashMap::new(),
            leases_by_key: HashMap::new(),
            closed: false,
        }
    }
}

/// Re-establish `key` as available carrying `value`, at the back (default)
/// or front of the list. If a BUFFER duplicate already occupies `available`
/// for this key, the existing node wins and `value` is dropped — see
/// DESIGN.md on why BUFFER can leave a key briefly both available and
/// in flight.
fn requeue<K: Eq + Hash + Clone, V>(
    state: &mut State<K, V>,
    key: K,
    value: V,
    requeue_front: bool,
) {
    if state.available.contains_key(&key) {
        trace!("requeue: buffered duplicate already available, dropping lease value");
        return;
    }
    let id = if requeue_front {
        state.list.prepend(key.clone(), value)
    } else {
        state.list.append(key.clone(), value)
    };
    state.available.insert(key, id);
}

/// Resolve a lease token for `ack`/`release`/the reaper: validates the
/// token, checks-then-sets `acknowledged` (checked before any removal
/// happens, so a second resolver always sees it — see DESIGN.md), and
/// removes the record from `in_flight`/`leases_by_key`.
fn resolve_lease<K: Eq + Hash + Clone, V>(
    state: &mut State<K, V>,
    token: &LeaseToken,
) -> Result<LeaseRecord<K, V>, QueueError> {
    let already_acknowledged = match state.in_flight.get(token) {
        None => return Err(QueueError::InvalidLease),
        Some(record) => record.acknowledged,
    };
    if already_acknowledged {
        return Err(QueueError::AlreadyAcknowledged);
    }
    if let Some(record) = state.in_flight.get_mut(token) {
        record.acknowledged = true;
    }
    let record = state
        .in_flight
        .remove(token)
        .expect("presence just confirmed under the same lock");
    // Only drop the reverse-index entry if it still points at the token
    // being resolved here, not at some other lease that has since reused
    // the same key.
    if state.leases_by_key.get(&record.key) == Some(token) {
        state.leases_by_key.remove(&record.key);
    }
    Ok(record)
}

fn issue_lease<K: Eq + Hash + Clone, V>(
    state: &mut State<K, V>,
    key: K,
    value: V,
    lease_timeout: Option<Duration>,
    default_timeout: Option<Duration>,
) -> LeaseToken {
    debug_assert!(
        !state.leases_by_key.contains_key(&key),
        "issuing a lease for a key that already has one in flight"
    );
    let token = LeaseToken::new();
    let timeout = lease_timeout.or(default_timeout);
    let record = LeaseRecord::new(key.clone(), value, timeout);
    state.in_flight.insert(token.clone(), record);
    state.leases_by_key.insert(key, token.clone());
    token
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    changed: Notify,
    default_lease_timeout: Option<Duration>,
    reaper_interval: Duration,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    reaper_shutdown: Notify,
    reaper_started: AtomicBool,
}

/// An in-memory, single-process keyed leased queue: simultaneously a FIFO
/// queue, a keyed map, and a lease-based work-distribution primitive.
///
/// Cheaply `Clone`-able; clones share the same underlying state. Not safe
/// to use across preemptive OS threads beyond the synchronization the
/// internal mutex already provides — this targets a single cooperative
/// scheduler, not multi-threaded parallelism.
pub struct LeasedQueue<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for LeasedQueue<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> LeasedQueue<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Construct a new, empty, unstarted queue.
    pub fn new(options: QueueOptions) -> Self {
        let inner = Inner {
            state: Mutex::new(State::new()),
            changed: Notify::new(),
            default_lease_timeout: options.default_lease_timeout,
            reaper_interval: options.reaper_interval,
            reaper: StdMutex::new(None),
            reaper_shutdown: Notify::new(),
            reaper_started: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Idempotently arm the background reaper, iff `default_lease_timeout`
    /// was configured. Safe to call more than once.
    pub fn start(&self) {
        if self.inner.default_lease_timeout.is_none() {
            return;
        }
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = spawn_reaper(self.inner.clone());
        *self.inner.reaper.lock().unwrap() = Some(handle);
    }

    /// Terminal shutdown: marks the queue closed, requeues every in-flight
    /// lease back to `available` (front of list, preserving priority — see
    /// DESIGN.md for the reasoning), cancels the reaper, and wakes every
    /// waiter so it observes `Closed`. Safe to call more than once; the
    /// second call is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let tokens: Vec<LeaseToken> = state.in_flight.keys().cloned().collect();
            for token in tokens {
                if let Some(record) = state.in_flight.remove(&token) {
                    state.leases_by_key.remove(&record.key);
                    requeue(&mut state, record.key, record.value, true);
                }
            }
        }
        self.inner.changed.notify_waiters();
        self.inner.reaper_shutdown.notify_waiters();
        let handle = self.inner.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run `f` against a started queue, guaranteeing `close()` on every
    /// exit path — including a panic inside `f`, which is caught, the
    /// queue closed, and then re-raised.
    pub async fn scoped<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T>,
    {
        self.start();
        let outcome = AssertUnwindSafe(f(self.clone())).catch_unwind().await;
        self.close().await;
        match outcome {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Producer entry point. Behavior against an in-flight key is governed
    /// by `policy`; see [`IfInFlight`].
    pub async fn put(&self, key: K, value: V, policy: IfInFlight) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(&node) = state.available.get(&key) {
            *state.list.value_mut(node) = value;
            trace!("put: overwrote available node in place, FIFO position preserved");
        } else if let Some(token) = state.leases_by_key.get(&key).cloned() {
            match policy {
                IfInFlight::Update => {
                    if let Some(record) = state.in_flight.get_mut(&token) {
                        record.value = value;
                    }
                    trace!("put: updated in-flight lease's buffered value");
                }
                IfInFlight::Reject => {
                    warn!("put: rejected, key is in flight");
                    return Err(QueueError::KeyInFlight);
                }
                IfInFlight::Buffer => {
                    let id = state.list.append(key.clone(), value);
                    state.available.insert(key, id);
                    trace!("put: buffered a second node for an in-flight key");
                }
            }
        } else {
            let id = state.list.append(key.clone(), value);
            state.available.insert(key, id);
            trace!("put: new key appended");
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Block until some available item is not already in flight, then lease
    /// the oldest such item. Ordinarily this is the literal list front in
    /// O(1); it only scans past a node when a BUFFER duplicate has left a
    /// still-in-flight key sitting in `available`. Fails `Timeout` if
    /// `wait_timeout` elapses first, `Closed` if the queue is or becomes
    /// closed.
    pub async fn get(
        &self,
        wait_timeout: Option<Duration>,
        lease_timeout: Option<Duration>,
    ) -> Result<(K, V, LeaseToken), QueueError> {
        let deadline = wait_timeout.map(|d| Instant::now() + d);
        let notified = self.inner.changed.notified();
        tokio::pin!(notified);
        loop {
            // Register interest before checking the predicate, so a
            // notify_waiters() that lands between our check and our wait
            // is never lost. See tokio::sync::Notify::enable.
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }
                // A BUFFER put can leave a key in `available` (the buffered
                // duplicate) while it's still in `leases_by_key` (the
                // original lease). That node is not eligible to be leased
                // out a second time, so skip past it to the next candidate
                // instead of taking the literal list front unconditionally.
                let candidate = state
                    .list
                    .iter_with_ids()
                    .find(|(_, key, _)| !state.leases_by_key.contains_key(*key))
                    .map(|(id, key, _)| (id, key.clone()));
                if let Some((id, key)) = candidate {
                    let (_, value) = state.list.unlink(id);
                    state.available.remove(&key);
                    let token = issue_lease(
                        &mut state,
                        key.clone(),
                        value.clone(),
                        lease_timeout,
                        self.inner.default_lease_timeout,
                    );
                    drop(state);
                    self.inner.changed.notify_waiters();
                    debug!(token = %token, "get: issued lease");
                    return Ok((key, value, token));
                }
            }
            wait_or_timeout(notified.as_mut(), deadline).await?;
            notified.set(self.inner.changed.notified());
        }
    }

    /// Block until `key` is available (present and not in flight), then
    /// unlink and lease it. Timeout/closed semantics match [`Self::get`].
    pub async fn take(
        &self,
        key: K,
        wait_timeout: Option<Duration>,
        lease_timeout: Option<Duration>,
    ) -> Result<(K, V, LeaseToken), QueueError> {
        let deadline = wait_timeout.map(|d| Instant::now() + d);
        let notified = self.inner.changed.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }
                // `available` holding `key` is not sufficient: a BUFFER put
                // can leave it there as a duplicate while the original lease
                // for this same key is still open in `leases_by_key`. That
                // duplicate isn't eligible to be leased yet; keep waiting.
                if !state.leases_by_key.contains_key(&key) {
                    if let Some(&node) = state.available.get(&key) {
                        let (k, value) = state.list.unlink(node);
                        state.available.remove(&key);
                        let token = issue_lease(
                            &mut state,
                            k.clone(),
                            value.clone(),
                            lease_timeout,
                            self.inner.default_lease_timeout,
                        );
                        drop(state);
                        self.inner.changed.notify_waiters();
                        debug!(token = %token, "take: issued lease");
                        return Ok((k, value, token));
                    }
                }
            }
            wait_or_timeout(notified.as_mut(), deadline).await?;
            notified.set(self.inner.changed.notified());
        }
    }

    /// Permanently resolve a lease: the item is gone for good.
    pub async fn ack(&self, token: &LeaseToken) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        let _record = resolve_lease(&mut state, token)?;
        drop(state);
        self.inner.changed.notify_waiters();
        trace!(token = %token, "ack: lease resolved");
        Ok(())
    }

    /// Resolve a lease by re-queuing its item back to `available`, at the
    /// back unless `requeue_front` is set.
    pub async fn release(&self, token: &LeaseToken, requeue_front: bool) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().await;
        let record = resolve_lease(&mut state, token)?;
        requeue(&mut state, record.key, record.value, requeue_front);
        drop(state);
        self.inner.changed.notify_waiters();
        trace!(token = %token, front = requeue_front, "release: lease requeued");
        Ok(())
    }

    /// Read-only: the value currently available under `key`, if any.
    /// In-flight values are not visible here.
    pub async fn peek(&self, key: &K) -> Option<V> {
        let state = self.inner.state.lock().await;
        state
            .available
            .get(key)
            .map(|&id| state.list.value(id).clone())
    }

    /// Read-only: whether `key` is currently available.
    pub async fn contains(&self, key: &K) -> bool {
        let state = self.inner.state.lock().await;
        state.available.contains_key(key)
    }

    /// Read-only snapshot of every available key.
    pub async fn available_keys(&self) -> HashSet<K> {
        let state = self.inner.state.lock().await;
        state.available.keys().cloned().collect()
    }

    /// Read-only snapshot of every in-flight key.
    pub async fn inflight_keys(&self) -> HashSet<K> {
        let state = self.inner.state.lock().await;
        state.leases_by_key.keys().cloned().collect()
    }

    /// Count of available items.
    pub async fn qsize(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.available.len()
    }

    /// Count of in-flight leases.
    pub async fn inflight_size(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.in_flight.len()
    }
}

#[cfg(test)]
impl<K, V> LeasedQueue<K, V>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
    V: Clone + Send + 'static,
{
    /// Assert that the three coupled indexes agree with each other and with
    /// the ordered list. Does not check that a key occupies at most one of
    /// `available`/`in_flight`: BUFFER puts create a documented transient
    /// overlap there, and tests that exercise BUFFER check that property
    /// explicitly around the window it applies to. Queue closedness and
    /// lease-token uniqueness are structural (enforced by `close` and
    /// `LeaseToken::new` respectively) rather than probed here.
    async fn assert_invariants(&self) {
        let state = self.inner.state.lock().await;
        assert_eq!(
            state.in_flight.len(),
            state.leases_by_key.len(),
            "in_flight and leases_by_key sizes diverged"
        );
        for (key, token) in &state.leases_by_key {
            let record = state
                .in_flight
                .get(token)
                .expect("leases_by_key points at a missing lease");
            assert_eq!(&record.key, key, "reverse index key mismatch");
        }
        assert_eq!(
            state.list.len_by_walk(),
            state.available.len(),
            "list and available sizes diverged"
        );
        for (id, key, _value) in state.list.iter_with_ids() {
            let indexed = state
                .available
                .get(key)
                .expect("linked node not indexed in available");
            assert_eq!(*indexed, id, "available does not point at the linked node");
        }
    }
}

/// Wait for either the deadline to elapse or `notified` to resolve.
/// `deadline == None` means wait indefinitely.
async fn wait_or_timeout(
    notified: std::pin::Pin<&mut tokio::sync::Notified<'_>>,
    deadline: Option<Instant>,
) -> Result<(), QueueError> {
    match deadline {
        None => {
            notified.await;
            Ok(())
        }
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(QueueError::Timeout);
            }
            match tokio::time::timeout(remaining, notified).await {
                Ok(()) => Ok(()),
                Err(_) => Err(QueueError::Timeout),
            }
        }
    }
}

fn spawn_reaper<K, V>(inner: Arc<Inner<K, V>>) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.reaper_interval) => {}
                _ = inner.reaper_shutdown.notified() => {}
            }
            let should_stop = {
                let state = inner.state.lock().await;
                state.closed
            };
            if should_stop {
                break;
            }
            reap_once(&inner).await;
        }
    })
}

async fn reap_once<K, V>(inner: &Inner<K, V>)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let now = Instant::now();
    let mut state = inner.state.lock().await;
    if state.closed {
        return;
    }
    let expired: Vec<LeaseToken> = state
        .in_flight
        .iter()
        .filter(|(_, record)| !record.acknowledged && record.is_expired(now))
        .map(|(token, _)| token.clone())
        .collect();
    let mut requeued_any = false;
    for token in expired {
        match resolve_lease(&mut state, &token) {
            Ok(record) => {
                requeue(&mut state, record.key, record.value, true);
                requeued_any = true;
            }
            Err(_) => {
                // Raced with a concurrent ack/release for the same token
                // between the scan snapshot and this resolution; the reaper
                // never surfaces errors to callers, so just log and move on.
                warn!("reaper: expired lease vanished before it could be requeued");
            }
        }
    }
    drop(state);
    if requeued_any {
        inner.changed.notify_waiters();
    }
}
