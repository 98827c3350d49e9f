//! Export lifecycle for the daemon's remote interfaces.
//!
//! The daemon presents four remote interfaces (activator, system,
//! monitor, registry). Each one can be exported or unexported
//! independently, and unexport during shutdown first waits for in-flight
//! calls to drain before it resorts to force. The transport itself lives
//! elsewhere; this module only tracks exported state and call counts so
//! shutdown has something truthful to drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// The remote interfaces the daemon exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iface {
    /// Object activation requests.
    Activator,
    /// Registration and administrative operations.
    System,
    /// Inactivity reports from group processes.
    Monitor,
    /// Read-only system lookup.
    Registry,
}

impl Iface {
    const ALL: [Self; 4] = [Self::Activator, Self::System, Self::Monitor, Self::Registry];

    const fn index(self) -> usize {
        match self {
            Self::Activator => 0,
            Self::System => 1,
            Self::Monitor => 2,
            Self::Registry => 3,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Activator => "activator",
            Self::System => "system",
            Self::Monitor => "monitor",
            Self::Registry => "registry",
        }
    }
}

impl std::fmt::Display for Iface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
struct ExportSlot {
    exported: AtomicBool,
    inflight: Arc<AtomicUsize>,
}

impl ExportSlot {
    fn new() -> Self {
        Self {
            exported: AtomicBool::new(true),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Flip to unexported. Without `force` this only succeeds while no
    /// call is in flight; a refused attempt leaves the slot exported.
    fn try_unexport(&self, force: bool) -> bool {
        self.exported.store(false, Ordering::SeqCst);
        if force || self.inflight.load(Ordering::Acquire) == 0 {
            true
        } else {
            self.exported.store(true, Ordering::SeqCst);
            false
        }
    }
}

/// Decrements the interface's in-flight count when the call returns.
#[derive(Debug)]
pub struct CallGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Release);
    }
}

/// Exported state for all four interfaces.
#[derive(Debug)]
pub struct ExportSet {
    slots: [ExportSlot; 4],
}

impl Default for ExportSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportSet {
    /// All interfaces start exported.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [
                ExportSlot::new(),
                ExportSlot::new(),
                ExportSlot::new(),
                ExportSlot::new(),
            ],
        }
    }

    /// Begin a call on `iface`. Returns `None` once the interface is
    /// unexported, which callers surface as a refused operation.
    pub fn enter(&self, iface: Iface) -> Option<CallGuard> {
        let slot = &self.slots[iface.index()];
        if !slot.exported.load(Ordering::SeqCst) {
            return None;
        }
        slot.inflight.fetch_add(1, Ordering::AcqRel);
        // An unexport may have won the race between the check and the
        // increment; roll back rather than entering a closed interface.
        if !slot.exported.load(Ordering::SeqCst) {
            slot.inflight.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(CallGuard {
            inflight: Arc::clone(&slot.inflight),
        })
    }

    /// Whether `iface` currently accepts calls.
    #[must_use]
    pub fn is_exported(&self, iface: Iface) -> bool {
        self.slots[iface.index()].exported.load(Ordering::SeqCst)
    }

    /// Calls currently inside `iface`.
    #[must_use]
    pub fn inflight(&self, iface: Iface) -> usize {
        self.slots[iface.index()].inflight.load(Ordering::Acquire)
    }

    /// Unexport every interface, giving in-flight calls until the
    /// deadline to drain, then forcing.
    pub async fn unexport_all(&self, timeout: Duration, poll: Duration) {
        let deadline = Instant::now() + timeout;
        for iface in Iface::ALL {
            let slot = &self.slots[iface.index()];
            loop {
                if slot.try_unexport(false) {
                    debug!(interface = %iface, "unexported cleanly");
                    break;
                }
                if Instant::now() >= deadline {
                    slot.try_unexport(true);
                    warn!(
                        interface = %iface,
                        inflight = slot.inflight.load(Ordering::Acquire),
                        "forced unexport with calls still in flight"
                    );
                    break;
                }
                tokio::time::sleep(poll).await;
            }
        }
    }
}
