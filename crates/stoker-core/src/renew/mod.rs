//! Client-side lease renewal manager.
//!
//! The manager keeps a set of leases alive by renewing each one before it
//! expires, until a caller-provided desired expiration is reached or
//! renewal fails for good.
//!
//! # Architecture
//!
//! ```text
//! renew_until ---> pending set (ordered by renew time)
//!                     |                    ^
//!              queuer wakes at the         | success: new grant,
//!              earliest dispatch time      | recompute renew time
//!                     v                    |
//!                  in-flight ---worker---> grantor
//!                     |
//!                     +-- definite failure or out of time --> listener
//! ```
//!
//! # Key Concepts
//!
//! - **Queuer**: a single lazily started task that sleeps until the next
//!   dispatch time, hands batches to workers, and exits when the pending
//!   set drains.
//! - **Worker**: one task per dispatched batch, bounded by a semaphore
//!   holding `max_tasks - 1` permits; the remaining slot belongs to the
//!   queuer itself.
//! - **Batching**: leases due within the batch window of a dispatched
//!   renewal ride along in the same remote call when both sides agree.
//! - **Deferred removal**: entries removed while their renewal is in
//!   flight are only marked; the completion then discards them, so a
//!   stale result can never resurrect a removed lease.
//!
//! Listener callbacks run on their own tasks after the lease has left the
//! managed set, so a listener may call straight back into the manager.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, RenewalConfig};
use crate::error::{CallError, RenewalError};
use crate::lease::{
    BatchItem, DURATION_ANY, Lease, LeaseKey, RenewalFailure, RenewalFailureListener,
};

mod schedule;

use schedule::{LeaseEntry, SlotKey, calc_actual_renews};

/// Longest the queuer sleeps before re-deriving its schedule. Renewal
/// times can sit days in the future; re-arming hourly keeps the sleep
/// well inside what the timer wheel accepts.
const MAX_PARK: Duration = Duration::from_secs(60 * 60);

/// Current wall-clock time in milliseconds since the Unix epoch, the unit
/// all lease expirations are expressed in.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct SchedState {
    /// Entries waiting for their next renewal, ordered by renewal time.
    pending: BTreeMap<SlotKey, LeaseEntry>,
    /// Lease identity to pending slot, for O(log n) replacement.
    index: HashMap<LeaseKey, SlotKey>,
    /// Entries checked out by a dispatched renewal task.
    in_flight: Vec<LeaseEntry>,
    next_id: u64,
    queuer_running: bool,
    closed: bool,
}

impl SchedState {
    fn insert_pending(&mut self, entry: LeaseEntry) {
        self.index.insert(entry.key(), entry.slot());
        self.pending.insert(entry.slot(), entry);
    }

    fn remove_pending(&mut self, key: LeaseKey) -> Option<LeaseEntry> {
        let slot = self.index.remove(&key)?;
        self.pending.remove(&slot)
    }

    fn reschedule(&mut self, rtt: i64, slots: usize) {
        calc_actual_renews(&mut self.pending, rtt, slots);
    }
}

struct ManagerInner {
    state: Mutex<SchedState>,
    /// Wakes the queuer when the schedule changes under it.
    wake: Notify,
    /// Worker pool bound: `max_tasks - 1` permits.
    pool: Arc<Semaphore>,
    rtt: i64,
    window: i64,
    slots: usize,
}

/// Manages a set of leases, renewing each before it expires.
///
/// Cloning is cheap and every clone drives the same managed set. All
/// methods must be called from within a tokio runtime; background tasks
/// are spawned on the ambient runtime as needed and exit on their own
/// when there is nothing left to renew.
#[derive(Clone)]
pub struct LeaseRenewalManager {
    inner: Arc<ManagerInner>,
}

impl Default for LeaseRenewalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseRenewalManager {
    /// A manager with default tuning (10 s round trip estimate, five
    /// minute batch window, eleven task slots).
    #[must_use]
    pub fn new() -> Self {
        Self::build(&RenewalConfig::default())
    }

    /// A manager with explicit tuning.
    pub fn with_config(config: RenewalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(&config))
    }

    fn build(config: &RenewalConfig) -> Self {
        let slots = config.max_tasks.saturating_sub(1).max(1);
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(SchedState {
                    pending: BTreeMap::new(),
                    index: HashMap::new(),
                    in_flight: Vec::new(),
                    next_id: 0,
                    queuer_running: false,
                    closed: false,
                }),
                wake: Notify::new(),
                pool: Arc::new(Semaphore::new(slots)),
                rtt: config.rtt_ms(),
                window: config.window_ms(),
                slots,
            }),
        }
    }

    /// Start renewing `lease` until `desired_expiration` (absolute epoch
    /// milliseconds; [`crate::lease::FOREVER`] keeps renewing until the
    /// lease is removed).
    ///
    /// Each renewal requests `renewal_duration` milliseconds, or lets the
    /// grantor choose when [`DURATION_ANY`] is given. Re-adding a lease
    /// that is already managed replaces its entry in place. `listener`,
    /// when present, is told once if the lease leaves the managed set
    /// before the desired expiration is honored, and once when the
    /// desired expiration is reached.
    pub fn renew_until(
        &self,
        lease: Arc<dyn Lease>,
        desired_expiration: i64,
        renewal_duration: i64,
        listener: Option<Arc<dyn RenewalFailureListener>>,
    ) -> Result<(), RenewalError> {
        if renewal_duration != DURATION_ANY && renewal_duration <= 0 {
            return Err(RenewalError::InvalidDuration {
                value: renewal_duration,
            });
        }
        let now = now_ms();
        let mut st = self.inner.state.lock().expect("lock poisoned");
        if st.closed {
            return Err(RenewalError::Closed);
        }
        let key = LeaseKey::of(&lease);
        st.remove_pending(key);
        for stale in st.in_flight.iter_mut().filter(|e| e.key() == key) {
            stale.doomed = true;
        }
        let id = st.next_id;
        st.next_id += 1;
        let mut entry = LeaseEntry::new(id, lease, desired_expiration, renewal_duration, listener);
        entry.calc_renew_time(now, self.inner.rtt);
        trace!(
            id,
            renew_time = entry.renew_time,
            end_time = entry.end_time,
            "managing lease"
        );
        st.insert_pending(entry);
        st.reschedule(self.inner.rtt, self.inner.slots);
        self.ensure_queuer(&mut st);
        drop(st);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Renew `lease` for `duration` milliseconds from now. Convenience
    /// wrapper over [`Self::renew_until`].
    pub fn renew_for(
        &self,
        lease: Arc<dyn Lease>,
        duration: i64,
        renewal_duration: i64,
        listener: Option<Arc<dyn RenewalFailureListener>>,
    ) -> Result<(), RenewalError> {
        let desired = now_ms().saturating_add(duration.max(0));
        self.renew_until(lease, desired, renewal_duration, listener)
    }

    /// Stop managing `lease` without touching the lease itself.
    ///
    /// If the lease's renewal is in flight, removal is deferred: the
    /// entry is marked and the completion discards it, with no listener
    /// notification either way.
    pub fn remove(&self, lease: &Arc<dyn Lease>) -> Result<(), RenewalError> {
        let key = LeaseKey::of(lease);
        let mut st = self.inner.state.lock().expect("lock poisoned");
        if st.remove_pending(key).is_some() {
            st.reschedule(self.inner.rtt, self.inner.slots);
            drop(st);
            self.inner.wake.notify_one();
            return Ok(());
        }
        let mut found = false;
        for entry in st
            .in_flight
            .iter_mut()
            .filter(|e| e.key() == key && !e.doomed)
        {
            entry.doomed = true;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(RenewalError::UnknownLease)
        }
    }

    /// Stop managing `lease` and cancel it at the grantor.
    pub async fn cancel(&self, lease: &Arc<dyn Lease>) -> Result<(), RenewalError> {
        self.remove(lease)?;
        lease
            .cancel()
            .await
            .map_err(|source| RenewalError::CancelFailed { source })
    }

    /// The desired expiration currently maintained for `lease`.
    pub fn get_expiration(&self, lease: &Arc<dyn Lease>) -> Result<i64, RenewalError> {
        let key = LeaseKey::of(lease);
        let st = self.inner.state.lock().expect("lock poisoned");
        if let Some(slot) = st.index.get(&key) {
            if let Some(entry) = st.pending.get(slot) {
                return Ok(entry.desired_expiration);
            }
        }
        st.in_flight
            .iter()
            .find(|e| e.key() == key && !e.doomed)
            .map(|e| e.desired_expiration)
            .ok_or(RenewalError::UnknownLease)
    }

    /// Change the desired expiration maintained for `lease`.
    ///
    /// Takes effect immediately for a pending lease; for one whose
    /// renewal is in flight, the new goal applies when that renewal
    /// completes.
    pub fn set_expiration(
        &self,
        lease: &Arc<dyn Lease>,
        desired_expiration: i64,
    ) -> Result<(), RenewalError> {
        let key = LeaseKey::of(lease);
        let mut st = self.inner.state.lock().expect("lock poisoned");
        if let Some(mut entry) = st.remove_pending(key) {
            entry.desired_expiration = desired_expiration;
            entry.calc_renew_time(now_ms(), self.inner.rtt);
            st.insert_pending(entry);
            st.reschedule(self.inner.rtt, self.inner.slots);
            self.ensure_queuer(&mut st);
            drop(st);
            self.inner.wake.notify_one();
            return Ok(());
        }
        let mut found = false;
        for entry in st
            .in_flight
            .iter_mut()
            .filter(|e| e.key() == key && !e.doomed)
        {
            entry.desired_expiration = desired_expiration;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(RenewalError::UnknownLease)
        }
    }

    /// Drop every managed lease without notifying listeners.
    pub fn clear(&self) {
        let mut st = self.inner.state.lock().expect("lock poisoned");
        st.pending.clear();
        st.index.clear();
        for entry in &mut st.in_flight {
            entry.doomed = true;
        }
        drop(st);
        self.inner.wake.notify_one();
    }

    /// Shut the manager down: drop all leases, stop the worker pool, and
    /// refuse further additions. In-flight renewals finish but their
    /// results are discarded.
    pub fn close(&self) {
        let mut st = self.inner.state.lock().expect("lock poisoned");
        st.closed = true;
        st.pending.clear();
        st.index.clear();
        for entry in &mut st.in_flight {
            entry.doomed = true;
        }
        drop(st);
        self.inner.pool.close();
        self.inner.wake.notify_one();
        debug!("renewal manager closed");
    }

    /// Number of leases currently managed (pending plus in flight).
    #[must_use]
    pub fn lease_count(&self) -> usize {
        let st = self.inner.state.lock().expect("lock poisoned");
        st.pending.len() + st.in_flight.iter().filter(|e| !e.doomed).count()
    }

    fn ensure_queuer(&self, st: &mut SchedState) {
        if st.queuer_running || st.closed || st.pending.is_empty() {
            return;
        }
        st.queuer_running = true;
        spawn_queuer(Arc::clone(&self.inner));
    }
}

/// One lease inside a dispatched batch, captured while the entry itself
/// sits in the in-flight list.
struct WorkItem {
    id: u64,
    lease: Arc<dyn Lease>,
    duration: i64,
}

type Notification = (Arc<dyn RenewalFailureListener>, RenewalFailure);

enum Step {
    /// Nothing due yet; sleep until `wake_at` or a schedule change.
    Park { wake_at: i64 },
    /// A batch was checked out and must be handed to a worker.
    Dispatch { items: Vec<WorkItem> },
    /// A lease reached its terminal instant and was dropped.
    Dropped { notifications: Vec<Notification> },
    /// Pending set is empty or the manager closed; the queuer is done.
    Exit,
}

fn next_step(inner: &ManagerInner) -> Step {
    let mut st = inner.state.lock().expect("lock poisoned");
    if st.closed || st.pending.is_empty() {
        st.queuer_running = false;
        return Step::Exit;
    }
    let now = now_ms();
    let Some((due_slot, due_actual)) = st
        .pending
        .values()
        .min_by_key(|e| e.actual_renew)
        .map(|e| (e.slot(), e.actual_renew))
    else {
        st.queuer_running = false;
        return Step::Exit;
    };
    if due_actual > now {
        return Step::Park {
            wake_at: due_actual,
        };
    }
    let Some(due) = st.pending.remove(&due_slot) else {
        return Step::Park {
            wake_at: now.saturating_add(1),
        };
    };
    st.index.remove(&due.key());

    if due.renewals_done() || due.end_time <= now {
        // Either the desired expiration was honored or the lease ran out
        // of time before a renewal landed. Both end management; the
        // event's missing cause tells them apart from definite failures.
        let mut notifications = Vec::new();
        debug!(
            id = due.id,
            reached_desired = due.renewals_done(),
            last_failure = ?due.last_error,
            "lease left the managed set"
        );
        if let Some(listener) = due.listener.clone() {
            notifications.push((
                listener,
                RenewalFailure {
                    lease: Arc::clone(&due.lease),
                    desired_expiration: due.desired_expiration,
                    error: None,
                },
            ));
        }
        st.reschedule(inner.rtt, inner.slots);
        return Step::Dropped { notifications };
    }

    // Fold in every pending lease due within the batch window that both
    // sides agree to renew alongside this one.
    let mut riders: Vec<SlotKey> = Vec::new();
    for (slot, entry) in &st.pending {
        if entry.renew_time.saturating_sub(due.renew_time) > inner.window {
            break;
        }
        if entry.renewals_done() {
            continue;
        }
        if entry.can_join_batch(&due, inner.rtt) {
            riders.push(*slot);
        }
    }
    let mut items = Vec::with_capacity(1 + riders.len());
    items.push(WorkItem {
        id: due.id,
        lease: Arc::clone(&due.lease),
        duration: due.request_duration(now),
    });
    st.in_flight.push(due);
    for slot in riders {
        let Some(entry) = st.pending.remove(&slot) else {
            continue;
        };
        st.index.remove(&entry.key());
        items.push(WorkItem {
            id: entry.id,
            lease: Arc::clone(&entry.lease),
            duration: entry.request_duration(now),
        });
        st.in_flight.push(entry);
    }
    st.reschedule(inner.rtt, inner.slots);
    trace!(batch = items.len(), "dispatching renewal");
    Step::Dispatch { items }
}

/// `run_queuer` and `run_renewal` start each other, so spawning either
/// one directly from the other would put each opaque future inside the
/// other's Send proof. Boxing this edge keeps the two independent.
fn spawn_queuer(inner: Arc<ManagerInner>) {
    tokio::spawn(Box::pin(run_queuer(inner)) as Pin<Box<dyn Future<Output = ()> + Send>>);
}

async fn run_queuer(inner: Arc<ManagerInner>) {
    loop {
        match next_step(&inner) {
            Step::Exit => return,
            Step::Park { wake_at } => {
                let pause = u64::try_from(wake_at.saturating_sub(now_ms())).unwrap_or(0);
                let pause = Duration::from_millis(pause).min(MAX_PARK);
                tokio::select! {
                    () = time::sleep(pause) => {}
                    () = inner.wake.notified() => {}
                }
            }
            Step::Dropped { notifications } => deliver(notifications),
            Step::Dispatch { items } => match Arc::clone(&inner.pool).acquire_owned().await {
                Ok(permit) => {
                    tokio::spawn(run_renewal(Arc::clone(&inner), items, permit));
                }
                Err(_) => {
                    // Closed while waiting for a slot; shed the batch.
                    let mut st = inner.state.lock().expect("lock poisoned");
                    st.in_flight
                        .retain(|e| !items.iter().any(|item| item.id == e.id));
                }
            },
        }
    }
}

async fn run_renewal(inner: Arc<ManagerInner>, items: Vec<WorkItem>, _permit: OwnedSemaphorePermit) {
    let results: Vec<Result<i64, CallError>> = if let [only] = items.as_slice() {
        vec![only.lease.renew(only.duration).await]
    } else {
        let batch: Vec<BatchItem> = items
            .iter()
            .map(|item| BatchItem {
                lease: Arc::clone(&item.lease),
                duration: item.duration,
            })
            .collect();
        items[0].lease.renew_batch(batch).await
    };

    let mut notifications: Vec<Notification> = Vec::new();
    let mut respawn = false;
    {
        let mut st = inner.state.lock().expect("lock poisoned");
        let now = now_ms();
        for (pos, item) in items.iter().enumerate() {
            let Some(idx) = st.in_flight.iter().position(|e| e.id == item.id) else {
                continue;
            };
            let mut entry = st.in_flight.swap_remove(idx);
            if entry.doomed || st.closed {
                continue;
            }
            let result = results.get(pos).cloned().unwrap_or_else(|| {
                Err(CallError::unmarshal_failed("batch reply missing an entry"))
            });
            match result {
                Ok(granted) => {
                    trace!(id = entry.id, granted, "lease renewed");
                    entry.end_time = granted;
                    entry.last_error = None;
                    entry.calc_renew_time(now, inner.rtt);
                    st.insert_pending(entry);
                }
                Err(error) if error.is_definite() => {
                    debug!(id = entry.id, %error, "definite renewal failure, dropping lease");
                    if let Some(listener) = entry.listener.clone() {
                        notifications.push((
                            listener,
                            RenewalFailure {
                                lease: Arc::clone(&entry.lease),
                                desired_expiration: entry.desired_expiration,
                                error: Some(error),
                            },
                        ));
                    }
                }
                Err(error) => {
                    warn!(id = entry.id, %error, "renewal failed, will retry");
                    entry.last_error = Some(error);
                    entry.delay_renew_time(inner.rtt);
                    if entry.end_time <= now {
                        // Out of time before any retry can land.
                        if let Some(listener) = entry.listener.clone() {
                            notifications.push((
                                listener,
                                RenewalFailure {
                                    lease: Arc::clone(&entry.lease),
                                    desired_expiration: entry.desired_expiration,
                                    error: None,
                                },
                            ));
                        }
                    } else {
                        st.insert_pending(entry);
                    }
                }
            }
        }
        st.reschedule(inner.rtt, inner.slots);
        if !st.closed && !st.pending.is_empty() && !st.queuer_running {
            st.queuer_running = true;
            respawn = true;
        }
    }
    if respawn {
        spawn_queuer(Arc::clone(&inner));
    }
    inner.wake.notify_one();
    deliver(notifications);
}

fn deliver(notifications: Vec<Notification>) {
    for (listener, failure) in notifications {
        tokio::spawn(async move {
            listener.renewal_failed(failure);
        });
    }
}
