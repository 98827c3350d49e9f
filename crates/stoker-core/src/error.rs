//! Error taxonomy for remote lease and activation calls.
//!
//! Every failure of a remote invocation is classified as either *definite*
//! (the call was received and rejected, so retrying cannot help) or
//! *indefinite* (the outcome of the call is unknown, so retrying may
//! succeed). Renewal scheduling and activation retry logic branch on this
//! classification rather than on individual variants.

use thiserror::Error;

/// Failure of a single remote call against a lease grantor or an
/// activation group.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The grantor does not know the lease (expired or cancelled remotely).
    #[error("unknown lease: {reason}")]
    UnknownLease { reason: String },

    /// The grantor refused the requested renewal.
    #[error("lease renewal rejected: {reason}")]
    LeaseRejected { reason: String },

    /// The call itself was malformed from the callee's point of view.
    #[error("bad invocation: {reason}")]
    BadInvocation { reason: String },

    /// The remote endpoint exists but cannot service this object.
    #[error("bad object: {reason}")]
    BadObject { reason: String },

    /// The transport could not reach the remote endpoint at all.
    #[error("connect failed: {reason}")]
    ConnectFailed { reason: String },

    /// The connection was established but dropped before a reply arrived.
    #[error("connection dropped: {reason}")]
    ConnectionDropped { reason: String },

    /// No reply arrived within the transport deadline.
    #[error("call timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// A reply arrived but could not be decoded.
    #[error("failed to unmarshal reply: {reason}")]
    UnmarshalFailed { reason: String },
}

impl CallError {
    pub fn unknown_lease(reason: impl Into<String>) -> Self {
        Self::UnknownLease {
            reason: reason.into(),
        }
    }

    pub fn lease_rejected(reason: impl Into<String>) -> Self {
        Self::LeaseRejected {
            reason: reason.into(),
        }
    }

    pub fn bad_invocation(reason: impl Into<String>) -> Self {
        Self::BadInvocation {
            reason: reason.into(),
        }
    }

    pub fn bad_object(reason: impl Into<String>) -> Self {
        Self::BadObject {
            reason: reason.into(),
        }
    }

    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    pub fn connection_dropped(reason: impl Into<String>) -> Self {
        Self::ConnectionDropped {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn timeout(elapsed_ms: u64) -> Self {
        Self::Timeout { elapsed_ms }
    }

    pub fn unmarshal_failed(reason: impl Into<String>) -> Self {
        Self::UnmarshalFailed {
            reason: reason.into(),
        }
    }

    /// Whether the remote end definitely received and rejected the call.
    ///
    /// A definite failure is final: the same call will keep failing, so the
    /// caller must give up rather than retry.
    #[must_use]
    pub const fn is_definite(&self) -> bool {
        matches!(
            self,
            Self::UnknownLease { .. }
                | Self::LeaseRejected { .. }
                | Self::BadInvocation { .. }
                | Self::BadObject { .. }
        )
    }

    /// Whether the outcome of the call is unknown and a retry may succeed.
    #[must_use]
    pub const fn is_indefinite(&self) -> bool {
        !self.is_definite()
    }
}

/// Local error from the lease renewal manager itself, as opposed to a
/// failure of a remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenewalError {
    /// The lease is not currently managed by this manager.
    #[error("lease is not managed by this renewal manager")]
    UnknownLease,

    /// A renewal duration that is neither positive nor the ANY sentinel.
    #[error("invalid renewal duration: {value}")]
    InvalidDuration { value: i64 },

    /// The manager has been closed and accepts no further leases.
    #[error("renewal manager is closed")]
    Closed,

    /// The grantor failed or rejected an explicit cancellation.
    #[error("lease cancellation failed: {source}")]
    CancelFailed {
        #[source]
        source: CallError,
    },
}
