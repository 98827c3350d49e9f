//! stoker-core - Lease renewal management library
//!
//! This library keeps remotely granted leases alive on behalf of their
//! holders. Callers hand a lease to the [`renew::LeaseRenewalManager`]
//! together with a desired expiration, and the manager renews it behind
//! the scenes until that goal is met, the lease is removed, or renewal
//! fails for good.
//!
//! # Runtime Requirements
//!
//! The renewal manager spawns its queuer and worker tasks on the ambient
//! tokio runtime, so every manager method must be called from within one.
//! Both multi-threaded and current-thread runtimes work.
//!
//! # Modules
//!
//! - [`lease`]: the [`lease::Lease`] contract a transport binding
//!   implements, lease identity, and failure listener types
//! - [`renew`]: the renewal manager, its queuer, and its scheduling
//!   arithmetic
//! - [`config`]: tuning knobs (round trip estimate, batch window, task
//!   pool bound)
//! - [`error`]: the definite/indefinite remote call error taxonomy

pub mod config;
pub mod error;
pub mod lease;
pub mod renew;

pub use config::{ConfigError, RenewalConfig};
pub use error::{CallError, RenewalError};
pub use lease::{
    BatchItem, DURATION_ANY, FOREVER, Lease, LeaseKey, RenewalFailure, RenewalFailureListener,
};
pub use renew::{LeaseRenewalManager, now_ms};
