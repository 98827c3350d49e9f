//! Lease abstraction over an expiring grant of a remote resource.
//!
//! A lease is granted until an absolute expiration time (milliseconds since
//! the Unix epoch) and must be renewed before that time or the resource is
//! reclaimed by the grantor. The renewal manager in [`crate::renew`] does
//! the renewing; this module only defines the contract a transport binding
//! has to implement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CallError;

/// Sentinel renewal duration: let the grantor pick the length of each
/// renewal.
pub const DURATION_ANY: i64 = -1;

/// Absolute expiration meaning "keep renewing until explicitly removed".
pub const FOREVER: i64 = i64::MAX;

/// An expiring grant held against a remote grantor.
///
/// Implementations wrap whatever transport the grantor speaks. All times
/// are absolute wall-clock milliseconds since the Unix epoch, as reported
/// by the grantor.
#[async_trait]
pub trait Lease: Send + Sync + 'static {
    /// The expiration the grantor most recently granted.
    fn expiration(&self) -> i64;

    /// Ask the grantor to extend the lease by `duration` milliseconds
    /// ([`DURATION_ANY`] lets the grantor choose). Returns the newly
    /// granted absolute expiration.
    async fn renew(&self, duration: i64) -> Result<i64, CallError>;

    /// Cancel the lease at the grantor.
    async fn cancel(&self) -> Result<(), CallError>;

    /// Whether this lease and `other` can be renewed in one remote call.
    ///
    /// Both directions are consulted before two leases are batched; a
    /// transport that cannot batch at all can keep the default.
    fn can_batch(&self, other: &dyn Lease) -> bool {
        let _ = other;
        false
    }

    /// Renew every lease in `batch` using as few remote calls as the
    /// transport allows. `batch` always contains this lease as its first
    /// element. The result must have one entry per item, in order.
    ///
    /// The default performs one call per lease, which is correct for any
    /// transport but forfeits batching.
    async fn renew_batch(&self, batch: Vec<BatchItem>) -> Vec<Result<i64, CallError>> {
        let mut results = Vec::with_capacity(batch.len());
        for item in batch {
            results.push(item.lease.renew(item.duration).await);
        }
        results
    }
}

/// One lease inside a batched renewal, paired with the duration to request
/// for it.
pub struct BatchItem {
    pub lease: Arc<dyn Lease>,
    pub duration: i64,
}

/// Identity of a managed lease.
///
/// Two `Arc<dyn Lease>` handles denote the same managed lease exactly when
/// they point at the same allocation. Re-adding a clone of an already
/// managed handle therefore replaces the existing entry instead of
/// scheduling a second renewal stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseKey(usize);

impl LeaseKey {
    #[must_use]
    pub fn of(lease: &Arc<dyn Lease>) -> Self {
        Self(Arc::as_ptr(lease) as *const () as usize)
    }
}

impl fmt::Debug for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseKey({:#x})", self.0)
    }
}

/// Why a lease left the renewal manager without reaching its desired
/// expiration.
pub struct RenewalFailure {
    /// The lease that is no longer being renewed.
    pub lease: Arc<dyn Lease>,
    /// The expiration the caller originally asked the manager to maintain.
    pub desired_expiration: i64,
    /// The definite error that ended renewal, or `None` when the lease
    /// simply ran out of time before a renewal could land.
    pub error: Option<CallError>,
}

impl fmt::Debug for RenewalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalFailure")
            .field("desired_expiration", &self.desired_expiration)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Receiver for renewal failure events.
///
/// Listeners are invoked from dedicated tasks after the lease has already
/// been dropped from the manager, so they may block or call back into the
/// manager freely.
pub trait RenewalFailureListener: Send + Sync + 'static {
    fn renewal_failed(&self, failure: RenewalFailure);
}

impl<F> RenewalFailureListener for F
where
    F: Fn(RenewalFailure) + Send + Sync + 'static,
{
    fn renewal_failed(&self, failure: RenewalFailure) {
        self(failure);
    }
}

/// In-memory lease grantor used by examples and tests.
///
/// Grants every renewal request, honoring the requested duration up to
/// `max_grant` milliseconds. Time is read from the caller's clock, so this
/// is only suitable for single-process use.
pub struct LocalLease {
    expiration: std::sync::atomic::AtomicI64,
    max_grant: i64,
    batch_group: Option<String>,
}

impl LocalLease {
    #[must_use]
    pub fn new(expiration: i64, max_grant: i64) -> Self {
        Self {
            expiration: std::sync::atomic::AtomicI64::new(expiration),
            max_grant,
            batch_group: None,
        }
    }

    /// A lease that will batch with any other `LocalLease` in the same
    /// named group.
    #[must_use]
    pub fn in_batch_group(expiration: i64, max_grant: i64, group: impl Into<String>) -> Self {
        Self {
            expiration: std::sync::atomic::AtomicI64::new(expiration),
            max_grant,
            batch_group: Some(group.into()),
        }
    }
}

#[async_trait]
impl Lease for LocalLease {
    fn expiration(&self) -> i64 {
        self.expiration.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn renew(&self, duration: i64) -> Result<i64, CallError> {
        if duration != DURATION_ANY && duration <= 0 {
            return Err(CallError::bad_invocation(format!(
                "non-positive renewal duration {duration}"
            )));
        }
        let granted = if duration == DURATION_ANY {
            self.max_grant
        } else {
            duration.min(self.max_grant)
        };
        let now = crate::renew::now_ms();
        let expiration = now.saturating_add(granted);
        self.expiration
            .store(expiration, std::sync::atomic::Ordering::SeqCst);
        Ok(expiration)
    }

    async fn cancel(&self) -> Result<(), CallError> {
        self.expiration
            .store(0, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn can_batch(&self, _other: &dyn Lease) -> bool {
        // Group membership of the peer is not visible through the trait
        // object, so a grouped lease batches with anything that also
        // agrees. Ungrouped leases never batch.
        self.batch_group.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_key_tracks_allocation_identity() {
        let a: Arc<dyn Lease> = Arc::new(LocalLease::new(0, 1_000));
        let b: Arc<dyn Lease> = Arc::new(LocalLease::new(0, 1_000));
        let a2 = Arc::clone(&a);

        assert_eq!(LeaseKey::of(&a), LeaseKey::of(&a2));
        assert_ne!(LeaseKey::of(&a), LeaseKey::of(&b));
    }

    #[tokio::test]
    async fn local_lease_caps_grant() {
        let lease = LocalLease::new(0, 500);
        let granted = lease.renew(10_000).await.unwrap();
        let now = crate::renew::now_ms();
        assert!(granted <= now + 500);
        assert_eq!(granted, lease.expiration());
    }

    #[tokio::test]
    async fn local_lease_rejects_zero_duration() {
        let lease = LocalLease::new(0, 500);
        let err = lease.renew(0).await.unwrap_err();
        assert!(err.is_definite());
    }
}
