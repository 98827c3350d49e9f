//! The activation daemon: registry, group lifecycle, and recovery.
//!
//! # Architecture
//!
//! ```text
//!                     +--------------------------+
//!   remote calls ---> |     ActivationDaemon     |
//!   (proto layer)     |                          |
//!                     |  tables: RwLock          |
//!                     |    objects: id -> group  |
//!                     |    groups:  id -> entry  |---> journal (fsync'd
//!                     |                          |     before mutation)
//!                     +-----+----------------+---+
//!                           |                |
//!                     spawn | group_sem      | watch
//!                           v                v
//!                     group process      watchdog task
//!                     (bootstrap on      (owns the child,
//!                      stdin, calls       reports exit)
//!                      back active_group)
//! ```
//!
//! # Key Concepts
//!
//! - **Journal-before-mutate**: every registry mutation is appended to
//!   the journal and fsynced before the in-memory tables change, so a
//!   crash can always be replayed to the exact pre-crash state.
//! - **Incarnation**: bumped once per child spawn. Callbacks and
//!   watchdog reports carry the incarnation they were issued under;
//!   anything stale is refused or ignored.
//! - **Throttled creation**: a semaphore bounds how many group spawns
//!   (exec plus registration handshake) run at once, acquired outside
//!   every lock.
//! - **Two shutdown paths**: the graceful one drains remote calls and
//!   terminates children politely; the abrupt one just kills every
//!   known pid so a dying daemon leaves no orphans.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde::Serialize;
use stoker_core::CallError;
use thiserror::Error;
use tokio::sync::{Notify, RwLock, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StokerConfig;
use crate::export::ExportSet;
use crate::group::{
    ChildHandle, GroupDesc, GroupEntry, GroupId, GroupInstantiator, GroupStatus, MarshalledProxy,
    ObjectDesc, ObjectEntry, ObjectId,
};
use crate::journal::{DaemonSnapshot, GroupSnapshot, Journal, JournalError, LogRecord};
use crate::spawn::{self, GroupBootstrap};
use crate::watchdog;

/// How long a child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Errors surfaced by daemon operations.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("unknown object {object}")]
    UnknownObject { object: ObjectId },

    #[error("unknown group {group}")]
    UnknownGroup { group: GroupId },

    #[error("stale incarnation for group {group}: presented {presented}, current {current}")]
    StaleIncarnation {
        group: GroupId,
        presented: u64,
        current: u64,
    },

    /// The group's child never completed its registration handshake.
    #[error("group {group} did not register within the startup timeout")]
    GroupTimeout { group: GroupId },

    /// The group's child is being torn down and cannot accept work.
    #[error("group {group} is shutting down")]
    GroupInactive { group: GroupId },

    #[error("failed to start group {group}: {reason}")]
    Exec { group: GroupId, reason: String },

    /// The group refused to instantiate the object. Not retried.
    #[error("instantiation of {object} failed: {reason}")]
    Instantiation { object: ObjectId, reason: String },

    #[error("activation of {object} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        object: ObjectId,
        attempts: usize,
        reason: String,
    },

    #[error("activation daemon is shutting down")]
    ShuttingDown,

    #[error("name {name} is not bound")]
    NotBound { name: String },

    #[error("the system registry is read-only")]
    ReadOnlyRegistry,

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// The two registry tables. One lock covers both so the object-to-group
/// index can never disagree with the group entries.
struct Tables {
    objects: HashMap<ObjectId, GroupId>,
    groups: HashMap<GroupId, GroupEntry>,
}

#[derive(Serialize)]
struct SystemRef<'a> {
    system: &'a Uuid,
}

pub struct ActivationDaemon {
    config: StokerConfig,
    daemon_id: Uuid,
    tables: RwLock<Tables>,
    journal: StdMutex<Journal>,
    /// Bounds concurrent group spawns, exec plus handshake.
    group_sem: Arc<Semaphore>,
    shutting_down: AtomicBool,
    /// Wakes everything parked on the throttle or a group transition
    /// when shutdown begins.
    shutdown_notify: Notify,
    fatal_tx: watch::Sender<Option<String>>,
    /// Pids of live children, maintained alongside the group entries.
    /// Kept separately so the abrupt kill path needs no async lock.
    live_pids: StdMutex<HashMap<GroupId, u32>>,
    exports: ExportSet,
    system_ref: MarshalledProxy,
    self_weak: Weak<Self>,
}

impl std::fmt::Debug for ActivationDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationDaemon")
            .field("daemon_id", &self.daemon_id)
            .field("state_dir", &self.config.daemon.state_dir)
            .finish_non_exhaustive()
    }
}

impl ActivationDaemon {
    /// Open the state directory, replay the journal, and bring the
    /// daemon up with the exact pre-crash registry.
    pub fn recover(config: StokerConfig) -> Result<Arc<Self>, JournalError> {
        let (journal, state) = Journal::open(
            &config.daemon.state_dir,
            config.daemon.snapshot_threshold,
        )?;

        let mut tables = Tables {
            objects: state.objects,
            groups: HashMap::new(),
        };
        for (group, snap) in state.groups {
            let mut entry = GroupEntry::new(snap.desc);
            entry.incarnation = snap.incarnation;
            for (object, desc) in snap.objects {
                if desc.restart {
                    entry.restart.insert(object);
                }
                entry.objects.insert(object, ObjectEntry::new(desc));
            }
            tables.groups.insert(group, entry);
        }

        let daemon_id = Uuid::new_v4();
        let system_ref =
            MarshalledProxy::marshal(&SystemRef { system: &daemon_id }).map_err(std::io::Error::other)?;
        let (fatal_tx, _) = watch::channel(None);

        info!(
            %daemon_id,
            state_dir = %config.daemon.state_dir.display(),
            groups = tables.groups.len(),
            objects = tables.objects.len(),
            "activation daemon recovered"
        );

        Ok(Arc::new_cyclic(|weak| Self {
            group_sem: Arc::new(Semaphore::new(config.daemon.group_throttle)),
            config,
            daemon_id,
            tables: RwLock::new(tables),
            journal: StdMutex::new(journal),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            fatal_tx,
            live_pids: StdMutex::new(HashMap::new()),
            exports: ExportSet::new(),
            system_ref,
            self_weak: weak.clone(),
        }))
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Observe fatal persistence failures. The value flips to `Some`
    /// with a reason when the daemon can no longer honor durability.
    #[must_use]
    pub fn fatal_watch(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    pub(crate) fn exports(&self) -> &ExportSet {
        &self.exports
    }

    pub(crate) fn system_ref(&self) -> &MarshalledProxy {
        &self.system_ref
    }

    /// Groups with a live child process right now.
    #[must_use]
    pub fn live_children(&self) -> Vec<(GroupId, u32)> {
        let pids = self.live_pids.lock().expect("lock poisoned");
        let mut live: Vec<_> = pids.iter().map(|(group, pid)| (*group, *pid)).collect();
        live.sort();
        live
    }

    fn ensure_open(&self) -> Result<(), ActivationError> {
        if self.is_shutting_down() {
            return Err(ActivationError::ShuttingDown);
        }
        Ok(())
    }

    /// Durably append one record; on fatal journal failure the daemon
    /// flags itself for shutdown before surfacing the error.
    fn journal_append(&self, record: &LogRecord) -> Result<bool, ActivationError> {
        let result = {
            let mut journal = self.journal.lock().expect("lock poisoned");
            journal.append(record)
        };
        match result {
            Ok(due) => Ok(due),
            Err(e) => {
                if e.is_fatal() {
                    self.report_fatal(&e);
                }
                Err(e.into())
            }
        }
    }

    fn report_fatal(&self, error: &JournalError) {
        error!(%error, "persistence failure, daemon can no longer run safely");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.group_sem.close();
        self.shutdown_notify.notify_waiters();
        let _ = self.fatal_tx.send(Some(error.to_string()));
    }

    fn build_snapshot(tables: &Tables) -> DaemonSnapshot {
        DaemonSnapshot {
            objects: tables.objects.clone(),
            groups: tables
                .groups
                .iter()
                .filter(|(_, entry)| !entry.removed)
                .map(|(group, entry)| {
                    (
                        *group,
                        GroupSnapshot {
                            desc: entry.desc.clone(),
                            incarnation: entry.incarnation,
                            objects: entry
                                .objects
                                .iter()
                                .map(|(object, obj)| (*object, obj.desc.clone()))
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn maybe_snapshot(&self, due: bool, tables: &Tables) {
        if !due {
            return;
        }
        let snap = Self::build_snapshot(tables);
        let mut journal = self.journal.lock().expect("lock poisoned");
        if let Err(e) = journal.snapshot(&snap) {
            drop(journal);
            self.report_fatal(&e);
        }
    }

    // ------------------------------------------------------------------
    // Registration and descriptors
    // ------------------------------------------------------------------

    pub async fn register_group(&self, desc: GroupDesc) -> Result<GroupId, ActivationError> {
        self.ensure_open()?;
        let group = GroupId::random();
        let mut tables = self.tables.write().await;
        let due = self.journal_append(&LogRecord::RegisterGroup {
            group,
            desc: desc.clone(),
        })?;
        tables.groups.insert(group, GroupEntry::new(desc));
        info!(%group, "activation group registered");
        self.maybe_snapshot(due, &tables);
        Ok(group)
    }

    pub async fn unregister_group(&self, group: GroupId) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        if !tables.groups.get(&group).is_some_and(|entry| !entry.removed) {
            return Err(ActivationError::UnknownGroup { group });
        }
        let due = self.journal_append(&LogRecord::UnregisterGroup { group })?;
        tables.objects.retain(|_, owner| *owner != group);
        if let Some(entry) = tables.groups.get_mut(&group) {
            if entry.has_live_child() {
                // The slot lingers until the watchdog confirms the exit;
                // shutdown still has to find and wait on the dying child.
                entry.removed = true;
                entry.instantiator = None;
                entry.objects.clear();
                entry.restart.clear();
                entry.status = GroupStatus::Terminating;
                if let Some(child) = &entry.child {
                    child.request_kill();
                }
                entry.touch();
            } else if let Some(entry) = tables.groups.remove(&group) {
                entry.touch();
            }
        }
        info!(%group, "activation group unregistered");
        self.maybe_snapshot(due, &tables);
        Ok(())
    }

    pub async fn register_object(
        &self,
        group: GroupId,
        desc: ObjectDesc,
    ) -> Result<ObjectId, ActivationError> {
        self.ensure_open()?;
        let object = ObjectId::random();
        let mut tables = self.tables.write().await;
        if !tables.groups.get(&group).is_some_and(|entry| !entry.removed) {
            return Err(ActivationError::UnknownGroup { group });
        }
        let due = self.journal_append(&LogRecord::RegisterObject {
            object,
            group,
            desc: desc.clone(),
        })?;
        tables.objects.insert(object, group);
        if let Some(entry) = tables.groups.get_mut(&group) {
            if desc.restart {
                entry.restart.insert(object);
            }
            entry.objects.insert(object, ObjectEntry::new(desc));
        }
        debug!(%object, %group, "object registered");
        self.maybe_snapshot(due, &tables);
        Ok(object)
    }

    pub async fn unregister_object(&self, object: ObjectId) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let Some(group) = tables.objects.get(&object).copied() else {
            return Err(ActivationError::UnknownObject { object });
        };
        let due = self.journal_append(&LogRecord::UnregisterObject { object })?;
        tables.objects.remove(&object);
        if let Some(entry) = tables.groups.get_mut(&group) {
            entry.objects.remove(&object);
            entry.restart.remove(&object);
        }
        debug!(%object, %group, "object unregistered");
        self.maybe_snapshot(due, &tables);
        Ok(())
    }

    /// Replace an object's descriptor, returning the previous one.
    pub async fn set_object_desc(
        &self,
        object: ObjectId,
        desc: ObjectDesc,
    ) -> Result<ObjectDesc, ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let Some(group) = tables.objects.get(&object).copied() else {
            return Err(ActivationError::UnknownObject { object });
        };
        let due = self.journal_append(&LogRecord::UpdateDesc {
            object,
            desc: desc.clone(),
        })?;
        let entry = tables
            .groups
            .get_mut(&group)
            .ok_or(ActivationError::UnknownObject { object })?;
        let obj = entry
            .objects
            .get_mut(&object)
            .ok_or(ActivationError::UnknownObject { object })?;
        let previous = std::mem::replace(&mut obj.desc, desc);
        if obj.desc.restart {
            entry.restart.insert(object);
        } else {
            entry.restart.remove(&object);
        }
        self.maybe_snapshot(due, &tables);
        Ok(previous)
    }

    /// Replace a group's descriptor, returning the previous one. Takes
    /// effect at the next child spawn; a live child is untouched.
    pub async fn set_group_desc(
        &self,
        group: GroupId,
        desc: GroupDesc,
    ) -> Result<GroupDesc, ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        if !tables.groups.get(&group).is_some_and(|entry| !entry.removed) {
            return Err(ActivationError::UnknownGroup { group });
        }
        let due = self.journal_append(&LogRecord::UpdateGroupDesc {
            group,
            desc: desc.clone(),
        })?;
        let entry = tables
            .groups
            .get_mut(&group)
            .ok_or(ActivationError::UnknownGroup { group })?;
        let previous = std::mem::replace(&mut entry.desc, desc);
        self.maybe_snapshot(due, &tables);
        Ok(previous)
    }

    pub async fn object_desc(&self, object: ObjectId) -> Result<ObjectDesc, ActivationError> {
        let tables = self.tables.read().await;
        let group = tables
            .objects
            .get(&object)
            .ok_or(ActivationError::UnknownObject { object })?;
        tables
            .groups
            .get(group)
            .and_then(|entry| entry.objects.get(&object))
            .map(|obj| obj.desc.clone())
            .ok_or(ActivationError::UnknownObject { object })
    }

    pub async fn group_desc(&self, group: GroupId) -> Result<GroupDesc, ActivationError> {
        let tables = self.tables.read().await;
        tables
            .groups
            .get(&group)
            .filter(|entry| !entry.removed)
            .map(|entry| entry.desc.clone())
            .ok_or(ActivationError::UnknownGroup { group })
    }

    pub async fn groups(&self) -> HashMap<GroupId, GroupDesc> {
        let tables = self.tables.read().await;
        tables
            .groups
            .iter()
            .filter(|(_, entry)| !entry.removed)
            .map(|(group, entry)| (*group, entry.desc.clone()))
            .collect()
    }

    pub async fn activatable_objects(&self) -> HashMap<ObjectId, ObjectDesc> {
        let tables = self.tables.read().await;
        tables
            .objects
            .iter()
            .filter_map(|(object, group)| {
                let desc = tables.groups.get(group)?.objects.get(object)?.desc.clone();
                Some((*object, desc))
            })
            .collect()
    }

    pub async fn group_incarnation(&self, group: GroupId) -> Result<u64, ActivationError> {
        let tables = self.tables.read().await;
        tables
            .groups
            .get(&group)
            .filter(|entry| !entry.removed)
            .map(|entry| entry.incarnation)
            .ok_or(ActivationError::UnknownGroup { group })
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Activate an object: hand back the cached proxy unless `force`,
    /// otherwise ask the (started-on-demand) group to instantiate it.
    ///
    /// A transient failure talking to the group marks the group inactive
    /// and retries the whole operation, bounded by `activate_retries`.
    /// Definite refusals surface immediately.
    pub async fn activate(
        &self,
        object: ObjectId,
        force: bool,
    ) -> Result<MarshalledProxy, ActivationError> {
        let attempts = self.config.daemon.activate_retries.max(1);
        let mut last_error: Option<CallError> = None;

        for attempt in 1..=attempts {
            self.ensure_open()?;
            let (group, resolved) = {
                let tables = self.tables.read().await;
                let group = *tables
                    .objects
                    .get(&object)
                    .ok_or(ActivationError::UnknownObject { object })?;
                let entry = tables
                    .groups
                    .get(&group)
                    .ok_or(ActivationError::UnknownObject { object })?;
                let obj = entry
                    .objects
                    .get(&object)
                    .ok_or(ActivationError::UnknownObject { object })?;
                if !force {
                    if let Some(proxy) = &obj.proxy {
                        return Ok(proxy.clone());
                    }
                }
                (group, self.resolve_desc(&entry.desc, &obj.desc))
            };

            let (instantiator, incarnation) = self.ensure_group_running(group).await?;
            match instantiator.new_instance(object, &resolved).await {
                Ok(proxy) => {
                    // Cache only while the incarnation that produced the
                    // proxy is still current; a crash during the call
                    // means this proxy points at a dead child.
                    let mut tables = self.tables.write().await;
                    if let Some(obj) = tables
                        .groups
                        .get_mut(&group)
                        .filter(|entry| entry.incarnation == incarnation)
                        .and_then(|entry| entry.objects.get_mut(&object))
                    {
                        obj.proxy = Some(proxy.clone());
                    }
                    return Ok(proxy);
                }
                Err(error) if error.is_indefinite() => {
                    warn!(
                        %object, %group, attempt, %error,
                        "group call failed, marking group inactive"
                    );
                    self.group_went_inactive(group, incarnation).await;
                    last_error = Some(error);
                }
                Err(error) => {
                    return Err(ActivationError::Instantiation {
                        object,
                        reason: error.to_string(),
                    });
                }
            }
        }

        let reason = last_error.map_or_else(|| "no cause recorded".to_string(), |e| e.to_string());
        Err(ActivationError::RetriesExhausted {
            object,
            attempts,
            reason,
        })
    }

    /// Object location falls back to the group's, then the daemon-wide
    /// default.
    fn resolve_desc(&self, group_desc: &GroupDesc, desc: &ObjectDesc) -> ObjectDesc {
        let mut resolved = desc.clone();
        if resolved.location.is_none() {
            resolved.location = group_desc
                .location
                .clone()
                .or_else(|| self.config.groups.location.clone());
        }
        resolved
    }

    /// A call into the group's child failed transiently: drop the
    /// instantiator and cached proxies so the next attempt starts fresh,
    /// and tear the child down if it is somehow still up.
    async fn group_went_inactive(&self, group: GroupId, incarnation: u64) {
        let mut tables = self.tables.write().await;
        let Some(entry) = tables.groups.get_mut(&group) else {
            return;
        };
        if entry.incarnation != incarnation {
            return;
        }
        entry.instantiator = None;
        for obj in entry.objects.values_mut() {
            obj.proxy = None;
        }
        if let Some(child) = &entry.child {
            child.request_kill();
            entry.status = GroupStatus::Terminating;
        }
        entry.touch();
    }

    /// Get the group's live instantiator, spawning its child first if
    /// necessary. Returns the instantiator together with the incarnation
    /// it belongs to.
    async fn ensure_group_running(
        &self,
        group: GroupId,
    ) -> Result<(Arc<dyn GroupInstantiator>, u64), ActivationError> {
        let wait_deadline = Instant::now() + self.config.daemon.group_timeout;

        loop {
            self.ensure_open()?;

            // Fast path and wait path under the read lock.
            let waiter = {
                let tables = self.tables.read().await;
                let entry = tables
                    .groups
                    .get(&group)
                    .filter(|entry| !entry.removed)
                    .ok_or(ActivationError::UnknownGroup { group })?;
                if let Some(instantiator) = &entry.instantiator {
                    return Ok((Arc::clone(instantiator), entry.incarnation));
                }
                if entry.status == GroupStatus::Normal && !entry.has_live_child() {
                    None
                } else {
                    // Someone else is creating or tearing down; wait for
                    // the next transition and re-check.
                    Some(entry.watch())
                }
            };

            if let Some(mut rx) = waiter {
                let remaining = wait_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ActivationError::GroupTimeout { group });
                }
                tokio::select! {
                    changed = rx.changed() => {
                        // A dropped sender means the entry went away; the
                        // re-check above reports UnknownGroup.
                        let _ = changed;
                    }
                    () = tokio::time::sleep(remaining) => {
                        return Err(ActivationError::GroupTimeout { group });
                    }
                    () = self.shutdown_notify.notified() => {
                        return Err(ActivationError::ShuttingDown);
                    }
                }
                continue;
            }

            // Spawn path. Throttle first, outside every lock, since exec
            // plus handshake is slow.
            let permit = tokio::select! {
                permit = Arc::clone(&self.group_sem).acquire_owned() => {
                    permit.map_err(|_| ActivationError::ShuttingDown)?
                }
                () = self.shutdown_notify.notified() => {
                    return Err(ActivationError::ShuttingDown);
                }
            };

            // Re-check under the write lock; another caller may have won
            // the spawn race while we queued for the throttle.
            let (incarnation, desc) = {
                let mut tables = self.tables.write().await;
                let Some(entry) = tables.groups.get_mut(&group).filter(|entry| !entry.removed)
                else {
                    return Err(ActivationError::UnknownGroup { group });
                };
                if let Some(instantiator) = &entry.instantiator {
                    return Ok((Arc::clone(instantiator), entry.incarnation));
                }
                if entry.status != GroupStatus::Normal || entry.has_live_child() {
                    drop(permit);
                    continue;
                }

                let incarnation = entry.incarnation + 1;
                let due = self.journal_append(&LogRecord::GroupIncarnation { group, incarnation })?;
                entry.incarnation = incarnation;
                entry.status = GroupStatus::Creating;
                entry.touch();
                let desc = entry.desc.clone();
                self.maybe_snapshot(due, &tables);
                (incarnation, desc)
            };

            info!(%group, incarnation, "starting group process");
            let bootstrap = GroupBootstrap {
                group,
                incarnation,
                location: desc
                    .location
                    .clone()
                    .or_else(|| self.config.groups.location.clone()),
                desc: desc.clone(),
            };
            let spawned = match spawn::spawn_group(&self.config.groups, &desc, &bootstrap).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    let mut tables = self.tables.write().await;
                    if let Some(entry) = tables.groups.get_mut(&group) {
                        if entry.incarnation == incarnation {
                            entry.status = GroupStatus::Normal;
                            entry.touch();
                        }
                    }
                    return Err(ActivationError::Exec {
                        group,
                        reason: e.to_string(),
                    });
                }
            };

            let (kill_tx, kill_rx) = watch::channel(false);
            let (exit_tx, exit_rx) = watch::channel(false);
            let pid = spawned.pid;
            {
                let mut tables = self.tables.write().await;
                let Some(entry) = tables.groups.get_mut(&group).filter(|entry| !entry.removed)
                else {
                    // Unregistered while we were exec'ing; the child dies
                    // with its handle.
                    drop(spawned);
                    return Err(ActivationError::UnknownGroup { group });
                };
                entry.child = Some(ChildHandle {
                    pid,
                    kill: kill_tx,
                    exited: exit_rx,
                });
                entry.touch();
            }
            self.live_pids
                .lock()
                .expect("lock poisoned")
                .insert(group, pid);
            tokio::spawn(watchdog::run(
                self.self_weak.clone(),
                group,
                incarnation,
                spawned.child,
                kill_rx,
                exit_tx,
                TERM_GRACE,
            ));

            // Handshake: wait for the child to call back active_group.
            let result = self.await_handshake(group, incarnation).await;
            drop(permit);
            return result;
        }
    }

    async fn await_handshake(
        &self,
        group: GroupId,
        incarnation: u64,
    ) -> Result<(Arc<dyn GroupInstantiator>, u64), ActivationError> {
        let deadline = Instant::now() + self.config.daemon.group_timeout;
        loop {
            let mut rx = {
                let tables = self.tables.read().await;
                let entry = tables
                    .groups
                    .get(&group)
                    .ok_or(ActivationError::UnknownGroup { group })?;
                if entry.incarnation != incarnation {
                    return Err(ActivationError::GroupInactive { group });
                }
                if let Some(instantiator) = &entry.instantiator {
                    return Ok((Arc::clone(instantiator), incarnation));
                }
                if entry.status != GroupStatus::Creating {
                    // The watchdog reset the group: the child died before
                    // it ever registered.
                    return Err(ActivationError::Exec {
                        group,
                        reason: "group process exited before registering".to_string(),
                    });
                }
                entry.watch()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abort_handshake(group, incarnation).await;
                return Err(ActivationError::GroupTimeout { group });
            }
            tokio::select! {
                changed = rx.changed() => {
                    let _ = changed;
                }
                () = tokio::time::sleep(remaining) => {
                    self.abort_handshake(group, incarnation).await;
                    return Err(ActivationError::GroupTimeout { group });
                }
                () = self.shutdown_notify.notified() => {
                    self.abort_handshake(group, incarnation).await;
                    return Err(ActivationError::ShuttingDown);
                }
            }
        }
    }

    /// Destroy a half-started child that never registered.
    async fn abort_handshake(&self, group: GroupId, incarnation: u64) {
        let mut tables = self.tables.write().await;
        let Some(entry) = tables.groups.get_mut(&group) else {
            return;
        };
        if entry.incarnation != incarnation {
            return;
        }
        warn!(%group, incarnation, "group registration handshake abandoned, destroying child");
        if let Some(child) = &entry.child {
            child.request_kill();
        }
        entry.status = GroupStatus::Terminating;
        entry.touch();
    }

    // ------------------------------------------------------------------
    // Child callbacks
    // ------------------------------------------------------------------

    /// A freshly spawned child registers itself as the group's live
    /// instantiator. The incarnation must match exactly; a predecessor
    /// reporting in late is refused.
    pub async fn active_group(
        &self,
        group: GroupId,
        incarnation: u64,
        instantiator: Arc<dyn GroupInstantiator>,
    ) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let entry = tables
            .groups
            .get_mut(&group)
            .filter(|entry| !entry.removed)
            .ok_or(ActivationError::UnknownGroup { group })?;
        if entry.incarnation != incarnation {
            return Err(ActivationError::StaleIncarnation {
                group,
                presented: incarnation,
                current: entry.incarnation,
            });
        }
        if matches!(entry.status, GroupStatus::Terminate | GroupStatus::Terminating) {
            return Err(ActivationError::GroupInactive { group });
        }
        entry.instantiator = Some(instantiator);
        if entry.status == GroupStatus::Creating {
            entry.status = GroupStatus::Normal;
        }
        entry.touch();
        info!(%group, incarnation, "group registered as active");
        Ok(())
    }

    /// A group reports that it instantiated (or re-exported) an object
    /// on its own; the proxy becomes the cached one.
    pub async fn active_object(
        &self,
        object: ObjectId,
        proxy: MarshalledProxy,
    ) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let Some(group) = tables.objects.get(&object).copied() else {
            return Err(ActivationError::UnknownObject { object });
        };
        let obj = tables
            .groups
            .get_mut(&group)
            .and_then(|entry| entry.objects.get_mut(&object))
            .ok_or(ActivationError::UnknownObject { object })?;
        obj.proxy = Some(proxy);
        Ok(())
    }

    /// A group reports that an object went inactive; the cached proxy is
    /// dropped so the next activation asks the group again.
    pub async fn inactive_object(&self, object: ObjectId) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let Some(group) = tables.objects.get(&object).copied() else {
            return Err(ActivationError::UnknownObject { object });
        };
        let obj = tables
            .groups
            .get_mut(&group)
            .and_then(|entry| entry.objects.get_mut(&object))
            .ok_or(ActivationError::UnknownObject { object })?;
        obj.proxy = None;
        Ok(())
    }

    /// A group announces it is going away voluntarily. Its child is torn
    /// down and the next activation spawns a fresh incarnation.
    pub async fn inactive_group(
        &self,
        group: GroupId,
        incarnation: u64,
    ) -> Result<(), ActivationError> {
        self.ensure_open()?;
        let mut tables = self.tables.write().await;
        let entry = tables
            .groups
            .get_mut(&group)
            .filter(|entry| !entry.removed)
            .ok_or(ActivationError::UnknownGroup { group })?;
        if entry.incarnation != incarnation {
            return Err(ActivationError::StaleIncarnation {
                group,
                presented: incarnation,
                current: entry.incarnation,
            });
        }
        entry.instantiator = None;
        for obj in entry.objects.values_mut() {
            obj.proxy = None;
        }
        if let Some(child) = &entry.child {
            entry.status = GroupStatus::Terminate;
            entry.touch();
            child.request_kill();
            entry.status = GroupStatus::Terminating;
        }
        entry.touch();
        info!(%group, incarnation, "group went inactive");
        Ok(())
    }

    /// Called by a watchdog when its child exits. Resets the group,
    /// detects crashes (exit while NORMAL or CREATING), and re-activates
    /// restart-flagged objects after a crash.
    pub(crate) async fn handle_group_exit(
        &self,
        group: GroupId,
        incarnation: u64,
        status: Option<ExitStatus>,
    ) {
        let mut restart_list: Vec<ObjectId> = Vec::new();
        let mut exited_pid: Option<u32> = None;
        {
            let mut tables = self.tables.write().await;
            let mut drop_entry = false;
            {
                let Some(entry) = tables.groups.get_mut(&group) else {
                    self.live_pids.lock().expect("lock poisoned").remove(&group);
                    return;
                };
                if entry.incarnation != incarnation {
                    debug!(%group, incarnation, "ignoring exit report from a stale incarnation");
                    return;
                }
                let crashed =
                    matches!(entry.status, GroupStatus::Normal | GroupStatus::Creating);
                exited_pid = entry.child.as_ref().map(|child| child.pid);
                entry.child = None;
                entry.instantiator = None;
                for obj in entry.objects.values_mut() {
                    obj.proxy = None;
                }
                entry.status = GroupStatus::Normal;
                entry.touch();
                if entry.removed {
                    drop_entry = true;
                } else if crashed && !self.is_shutting_down() {
                    restart_list = entry.restart.iter().copied().collect();
                    warn!(
                        %group, incarnation, ?status,
                        restartable = restart_list.len(),
                        "group process exited unexpectedly"
                    );
                }
            }
            if drop_entry {
                tables.groups.remove(&group);
            }
        }
        {
            // The pid table may already hold a successor incarnation's
            // pid; remove only the exited child's own.
            let mut pids = self.live_pids.lock().expect("lock poisoned");
            if exited_pid.is_none() || pids.get(&group).copied() == exited_pid {
                pids.remove(&group);
            }
        }

        // Re-activations run as their own tasks; each one spawns the
        // replacement child (once) through the normal activate path.
        for object in restart_list {
            let Some(daemon) = self.self_weak.upgrade() else {
                return;
            };
            Self::spawn_reactivation(daemon, object);
        }
    }

    /// Start one re-activation task. A plain fn that boxes the future:
    /// `handle_group_exit` sits inside `activate`'s call graph via the
    /// watchdog, so spawning `activate` directly here would put each
    /// opaque future inside the other's Send proof.
    fn spawn_reactivation(daemon: Arc<Self>, object: ObjectId) {
        let task = async move {
            if let Err(e) = daemon.activate(object, true).await {
                warn!(%object, error = %e, "automatic re-activation failed");
            }
        };
        tokio::spawn(Box::pin(task) as Pin<Box<dyn Future<Output = ()> + Send>>);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: refuse new operations, drain and unexport the
    /// remote interfaces, terminate every child, then write a final
    /// snapshot.
    pub async fn shutdown(&self) {
        let already = self.shutting_down.swap(true, Ordering::SeqCst);
        if !already {
            info!("activation daemon shutting down");
        }
        self.shutdown_notify.notify_waiters();
        self.group_sem.close();

        self.exports
            .unexport_all(
                self.config.daemon.unexport_timeout,
                self.config.daemon.unexport_wait,
            )
            .await;

        // Tell every watchdog to destroy its child, then wait for the
        // exits, bounded by the group timeout.
        let waiters: Vec<(GroupId, watch::Receiver<bool>)> = {
            let mut tables = self.tables.write().await;
            tables
                .groups
                .iter_mut()
                .filter_map(|(group, entry)| {
                    let child = entry.child.as_ref()?;
                    entry.instantiator = None;
                    entry.status = GroupStatus::Terminating;
                    child.request_kill();
                    let exited = child.exited.clone();
                    entry.touch();
                    Some((*group, exited))
                })
                .collect()
        };
        let deadline = Instant::now() + self.config.daemon.group_timeout;
        for (group, mut exited) in waiters {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, exited.wait_for(|done| *done)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => {
                    warn!(%group, "child did not confirm exit before the shutdown deadline");
                }
            }
        }

        let tables = self.tables.read().await;
        let snap = Self::build_snapshot(&tables);
        let mut journal = self.journal.lock().expect("lock poisoned");
        if let Err(e) = journal.snapshot(&snap) {
            warn!(error = %e, "final snapshot failed during shutdown");
        }
        info!("activation daemon stopped");
    }

    /// Abrupt teardown for the signal fast path: no draining, no
    /// snapshot, just SIGKILL every known child so none are orphaned.
    pub fn kill_all_now(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
        self.group_sem.close();
        let pids: Vec<(GroupId, u32)> = {
            let live = self.live_pids.lock().expect("lock poisoned");
            live.iter().map(|(group, pid)| (*group, *pid)).collect()
        };
        for (group, pid) in pids {
            warn!(%group, pid, "killing group process");
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                #[allow(clippy::cast_possible_wrap)]
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!(pid, error = %e, "kill failed, process likely already gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_captures_both_tables() {
        let group = GroupId::random();
        let object = ObjectId::random();
        let mut entry = GroupEntry::new(GroupDesc::default());
        entry.incarnation = 4;
        entry.objects.insert(object, ObjectEntry::new(ObjectDesc::new("a.B")));
        let mut tables = Tables {
            objects: HashMap::new(),
            groups: HashMap::new(),
        };
        tables.objects.insert(object, group);
        tables.groups.insert(group, entry);

        let snap = ActivationDaemon::build_snapshot(&tables);
        assert_eq!(snap.objects.get(&object), Some(&group));
        assert_eq!(snap.groups[&group].incarnation, 4);
        assert_eq!(snap.groups[&group].objects[&object].class_name, "a.B");
    }

    #[tokio::test]
    async fn location_falls_back_group_then_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = StokerConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.groups.location = Some("daemon-wide".to_string());
        let daemon = ActivationDaemon::recover(config).unwrap();

        let group_desc = GroupDesc {
            location: Some("group-level".to_string()),
            ..GroupDesc::default()
        };
        let resolved = daemon.resolve_desc(&group_desc, &ObjectDesc::new("a.B"));
        assert_eq!(resolved.location.as_deref(), Some("group-level"));

        let resolved = daemon.resolve_desc(&GroupDesc::default(), &ObjectDesc::new("a.B"));
        assert_eq!(resolved.location.as_deref(), Some("daemon-wide"));

        let mut own = ObjectDesc::new("a.B");
        own.location = Some("object-level".to_string());
        let resolved = daemon.resolve_desc(&group_desc, &own);
        assert_eq!(resolved.location.as_deref(), Some("object-level"));
    }

    #[tokio::test]
    async fn registration_round_trip_and_unknown_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = StokerConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        let daemon = ActivationDaemon::recover(config).unwrap();

        let group = daemon.register_group(GroupDesc::default()).await.unwrap();
        let object = daemon
            .register_object(group, ObjectDesc::restartable("svc.Impl"))
            .await
            .unwrap();

        assert_eq!(daemon.object_desc(object).await.unwrap().class_name, "svc.Impl");
        assert_eq!(daemon.groups().await.len(), 1);
        assert_eq!(daemon.activatable_objects().await.len(), 1);

        let previous = daemon
            .set_object_desc(object, ObjectDesc::new("svc.V2"))
            .await
            .unwrap();
        assert!(previous.restart);
        assert!(!daemon.object_desc(object).await.unwrap().restart);

        daemon.unregister_object(object).await.unwrap();
        assert!(matches!(
            daemon.object_desc(object).await,
            Err(ActivationError::UnknownObject { .. })
        ));
        daemon.unregister_group(group).await.unwrap();
        assert!(matches!(
            daemon.group_desc(group).await,
            Err(ActivationError::UnknownGroup { .. })
        ));

        assert!(matches!(
            daemon.register_object(group, ObjectDesc::new("x")).await,
            Err(ActivationError::UnknownGroup { .. })
        ));
    }

    fn stub_child(pid: u32) -> ChildHandle {
        let (kill, _) = watch::channel(false);
        let (_, exited) = watch::channel(false);
        ChildHandle { pid, kill, exited }
    }

    #[tokio::test]
    async fn exit_cleanup_only_removes_the_pid_it_reaped() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = StokerConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        let daemon = ActivationDaemon::recover(config).unwrap();
        let group = daemon.register_group(GroupDesc::default()).await.unwrap();

        // The exit report races a successor spawn: by the time the
        // cleanup runs, the pid table already holds the replacement
        // child's pid.
        {
            let mut tables = daemon.tables.write().await;
            tables.groups.get_mut(&group).unwrap().child = Some(stub_child(500));
        }
        daemon.live_pids.lock().unwrap().insert(group, 999);
        daemon.handle_group_exit(group, 0, None).await;
        assert_eq!(
            daemon.live_children(),
            vec![(group, 999)],
            "a successor's pid must survive the predecessor's exit report"
        );

        // Same report with the exited child's own pid in the table.
        {
            let mut tables = daemon.tables.write().await;
            tables.groups.get_mut(&group).unwrap().child = Some(stub_child(999));
        }
        daemon.handle_group_exit(group, 0, None).await;
        assert!(daemon.live_children().is_empty());
    }

    struct IncarnationBump {
        daemon: Weak<ActivationDaemon>,
        group: GroupId,
    }

    #[async_trait::async_trait]
    impl GroupInstantiator for IncarnationBump {
        async fn new_instance(
            &self,
            _object: ObjectId,
            _desc: &ObjectDesc,
        ) -> Result<MarshalledProxy, CallError> {
            // The group turns over while this call is in flight.
            if let Some(daemon) = self.daemon.upgrade() {
                let mut tables = daemon.tables.write().await;
                if let Some(entry) = tables.groups.get_mut(&self.group) {
                    entry.incarnation += 1;
                }
            }
            Ok(MarshalledProxy { bytes: vec![1] })
        }
    }

    #[tokio::test]
    async fn superseded_activation_does_not_cache_its_proxy() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = StokerConfig::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        let daemon = ActivationDaemon::recover(config).unwrap();
        let group = daemon.register_group(GroupDesc::default()).await.unwrap();
        let object = daemon
            .register_object(group, ObjectDesc::new("svc.Impl"))
            .await
            .unwrap();

        {
            let mut tables = daemon.tables.write().await;
            tables.groups.get_mut(&group).unwrap().instantiator =
                Some(Arc::new(IncarnationBump {
                    daemon: Arc::downgrade(&daemon),
                    group,
                }));
        }

        let proxy = daemon.activate(object, true).await.unwrap();
        assert_eq!(proxy.bytes, vec![1]);

        let tables = daemon.tables.read().await;
        assert!(
            tables.groups[&group].objects[&object].proxy.is_none(),
            "a proxy minted under a superseded incarnation must not be cached"
        );
    }
}
