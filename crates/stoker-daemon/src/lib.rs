//! stoker-daemon - the activation daemon.
//!
//! `stokerd` keeps a durable registry of activatable objects and the
//! process groups that host them, starts group child processes on
//! demand, supervises them, and survives its own crashes by replaying a
//! journal of every registry mutation.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration for the daemon and group launching.
//! - [`daemon`]: the registry, activation, and lifecycle core.
//! - [`export`]: exported-interface tracking and shutdown draining.
//! - [`group`]: identifiers, descriptors, and per-group runtime state.
//! - [`journal`]: the append-only operation log and snapshots.
//! - [`proto`]: the four remote interfaces a transport exposes.
//! - [`spawn`]: group child command assembly and launching.

pub mod config;
pub mod daemon;
pub mod export;
pub mod group;
pub mod journal;
pub mod proto;
pub mod spawn;

mod watchdog;

pub use config::{ConfigError, StokerConfig};
pub use daemon::{ActivationDaemon, ActivationError};
pub use group::{
    GroupDesc, GroupId, GroupInstantiator, MarshalledProxy, ObjectDesc, ObjectId,
};
pub use journal::{DaemonSnapshot, Journal, JournalError, LogRecord};
pub use proto::{ActivationMonitor, ActivationSystem, Activator, SYSTEM_NAME, SystemRegistry};
