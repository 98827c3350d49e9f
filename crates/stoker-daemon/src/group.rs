//! Activation group and object records.
//!
//! A *group* is one supervised child process hosting any number of
//! activatable *objects*. The daemon keeps a durable descriptor for both
//! and a transient runtime side (child handle, instantiator reference,
//! status) that is rebuilt from scratch after a restart.
//!
//! # Group status
//!
//! ```text
//!        register_group
//!              |
//!              v
//!           NORMAL <-------------------+
//!              |                       |
//!        activate() needs a child      | child exited,
//!              v                       | watchdog reset
//!          CREATING -------------------+
//!              |
//!          active_group callback
//!              v
//!           NORMAL (live child)
//!              |
//!        stop requested
//!              v
//!          TERMINATE --> TERMINATING --+
//!                                      | child exited
//!                                      v
//!                                   NORMAL
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use stoker_core::CallError;

/// Identifier of one activatable object, assigned by the daemon at
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Identifier of one activation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(Uuid);

impl GroupId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grp-{}", self.0)
    }
}

/// Durable description of an activatable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDesc {
    /// Implementation the group instantiates for this object.
    pub class_name: String,

    /// Where the implementation's code lives; falls back to the group's
    /// location, then the daemon-wide default.
    #[serde(default)]
    pub location: Option<String>,

    /// Opaque initialization data handed to the implementation.
    #[serde(default)]
    pub init_data: Vec<u8>,

    /// Whether the daemon re-activates this object on its own after the
    /// hosting group crashes.
    #[serde(default)]
    pub restart: bool,
}

impl ObjectDesc {
    #[must_use]
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            location: None,
            init_data: Vec::new(),
            restart: false,
        }
    }

    #[must_use]
    pub fn restartable(class_name: impl Into<String>) -> Self {
        let mut desc = Self::new(class_name);
        desc.restart = true;
        desc
    }
}

/// Durable description of an activation group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    /// Program to exec instead of the daemon-wide group command.
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments specific to this group, placed between the daemon-wide
    /// leading and trailing options.
    #[serde(default)]
    pub options: Vec<String>,

    /// Property overrides passed to the child as `-Dkey=value` arguments,
    /// in key order.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Code location for this group's objects.
    #[serde(default)]
    pub location: Option<String>,
}

/// A serialized remote reference, opaque to the daemon.
///
/// The daemon stores and returns these without interpreting them; only
/// the transport layer on either end knows the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalledProxy {
    pub bytes: Vec<u8>,
}

impl MarshalledProxy {
    /// Marshal a serializable value into an opaque proxy blob.
    pub fn marshal<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Recover the value a proxy blob was marshalled from.
    pub fn unmarshal<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }
}

/// The daemon-side view of a live group's instantiation service.
///
/// A group process provides this (through the transport layer) when it
/// reports in via `active_group`; the daemon then asks it to instantiate
/// objects on demand. Errors use the shared remote call taxonomy so the
/// daemon can tell a crashed group (indefinite) from a refusal
/// (definite).
#[async_trait]
pub trait GroupInstantiator: Send + Sync + 'static {
    async fn new_instance(
        &self,
        object: ObjectId,
        desc: &ObjectDesc,
    ) -> Result<MarshalledProxy, CallError>;
}

/// Lifecycle state of a group's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// No creation or teardown in progress. A child may or may not be
    /// live; `instantiator` tells.
    Normal,
    /// A child was spawned and the daemon is waiting for it to report in.
    Creating,
    /// Teardown was requested but not yet issued to the child.
    Terminate,
    /// The child was told to die; waiting for the watchdog to confirm.
    Terminating,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Creating => "creating",
            Self::Terminate => "terminate",
            Self::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

/// Handle to a group's live child process, shared between the group table
/// and the watchdog that owns the process itself.
pub(crate) struct ChildHandle {
    pub pid: u32,
    /// Tells the watchdog to destroy the child.
    pub kill: watch::Sender<bool>,
    /// Flips to true once the watchdog has reaped the child.
    pub exited: watch::Receiver<bool>,
}

impl ChildHandle {
    /// Ask the watchdog to destroy the child. Safe to call repeatedly.
    pub fn request_kill(&self) {
        let _ = self.kill.send(true);
    }
}

/// One registered object inside a group.
pub(crate) struct ObjectEntry {
    pub desc: ObjectDesc,
    /// Marshalled proxy from the most recent activation, handed straight
    /// back on non-forced activations. Never persisted.
    pub proxy: Option<MarshalledProxy>,
}

impl ObjectEntry {
    pub fn new(desc: ObjectDesc) -> Self {
        Self { desc, proxy: None }
    }
}

/// One registered group: durable descriptor plus transient runtime side.
pub(crate) struct GroupEntry {
    pub desc: GroupDesc,
    /// Bumped at the start of every child creation; stale callbacks and
    /// stale watchdog reports carry an older value and are ignored.
    pub incarnation: u64,
    pub objects: HashMap<ObjectId, ObjectEntry>,
    /// Objects re-activated automatically after a crash.
    pub restart: HashSet<ObjectId>,
    pub status: GroupStatus,
    /// Unregistered while the child was still live. The entry lingers,
    /// refusing all use, until the watchdog confirms the exit.
    pub removed: bool,
    pub child: Option<ChildHandle>,
    pub instantiator: Option<Arc<dyn GroupInstantiator>>,
    /// Bumped on every state transition so waiters can re-check.
    version: watch::Sender<u64>,
}

impl GroupEntry {
    pub fn new(desc: GroupDesc) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            desc,
            incarnation: 0,
            objects: HashMap::new(),
            restart: HashSet::new(),
            status: GroupStatus::Normal,
            removed: false,
            child: None,
            instantiator: None,
            version,
        }
    }

    /// Announce a state transition to anyone waiting on this group.
    pub fn touch(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Subscribe to state transitions; combined with re-reading the entry
    /// this gives lost-wakeup-free waiting.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Whether a child process is currently believed to be running.
    pub fn has_live_child(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_with_kind_prefix() {
        let object = ObjectId::random();
        let group = GroupId::random();
        assert!(object.to_string().starts_with("obj-"));
        assert!(group.to_string().starts_with("grp-"));
    }

    #[test]
    fn proxy_round_trips_values() {
        let proxy = MarshalledProxy::marshal(&("endpoint", 42)).unwrap();
        let (endpoint, port): (String, u16) = proxy.unmarshal().unwrap();
        assert_eq!(endpoint, "endpoint");
        assert_eq!(port, 42);
    }

    #[test]
    fn group_entry_starts_idle() {
        let entry = GroupEntry::new(GroupDesc::default());
        assert_eq!(entry.status, GroupStatus::Normal);
        assert_eq!(entry.incarnation, 0);
        assert!(!entry.has_live_child());
        assert!(entry.instantiator.is_none());
    }

    #[test]
    fn touch_wakes_watchers() {
        let entry = GroupEntry::new(GroupDesc::default());
        let mut rx = entry.watch();
        let before = *rx.borrow_and_update();
        entry.touch();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), before + 1);
    }

    #[test]
    fn status_renders_lowercase() {
        assert_eq!(GroupStatus::Creating.to_string(), "creating");
        assert_eq!(GroupStatus::Terminating.to_string(), "terminating");
    }
}
