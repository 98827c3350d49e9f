//! Per-child supervision task.
//!
//! Every spawned group process gets one watchdog. It owns the child
//! handle, waits for the process to exit or for a kill request from the
//! daemon, and reports the exit back so crashed groups can be reset and
//! restartable objects re-activated. Kill requests terminate gently
//! first (SIGTERM) and escalate to SIGKILL after a grace period.

use std::process::ExitStatus;
use std::sync::Weak;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::daemon::ActivationDaemon;
use crate::group::GroupId;

pub(crate) async fn run(
    daemon: Weak<ActivationDaemon>,
    group: GroupId,
    incarnation: u64,
    mut child: Child,
    mut kill_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<bool>,
    term_grace: Duration,
) {
    let status = supervise(&mut child, &mut kill_rx, term_grace).await;
    debug!(%group, incarnation, ?status, "group process exited");
    if let Some(daemon) = daemon.upgrade() {
        daemon.handle_group_exit(group, incarnation, status).await;
    }
    // Flipped only after the daemon's bookkeeping settled, so whoever
    // waits on it observes the group fully reaped.
    let _ = exit_tx.send(true);
}

async fn supervise(
    child: &mut Child,
    kill_rx: &mut watch::Receiver<bool>,
    term_grace: Duration,
) -> Option<ExitStatus> {
    loop {
        tokio::select! {
            res = child.wait() => return res.ok(),
            changed = kill_rx.changed() => {
                // A dropped sender means the group entry is gone; the
                // child must not outlive it.
                let requested = changed.is_err() || *kill_rx.borrow_and_update();
                if requested {
                    return terminate(child, term_grace).await;
                }
            }
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, term_grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(pid as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(res) = tokio::time::timeout(term_grace, child.wait()).await {
                    return res.ok();
                }
                warn!(%pid, "group process ignored SIGTERM, escalating");
            }
            Err(e) => debug!(%pid, error = %e, "SIGTERM delivery failed"),
        }
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill failed, process likely already gone");
    }
    child.wait().await.ok()
}
