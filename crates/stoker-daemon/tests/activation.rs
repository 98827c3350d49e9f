//! End-to-end activation lifecycle tests.
//!
//! These spawn real child processes (`sh -c 'sleep 30'` stands in for a
//! group runtime) and drive the registration handshake from the test,
//! playing the part of the child calling back into the daemon.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use stoker_core::CallError;
use stoker_daemon::config::StokerConfig;
use stoker_daemon::daemon::{ActivationDaemon, ActivationError};
use stoker_daemon::group::{
    GroupDesc, GroupId, GroupInstantiator, MarshalledProxy, ObjectDesc, ObjectId,
};
use tempfile::TempDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Counts instantiation requests and answers with a deterministic proxy.
struct TestInstantiator {
    calls: AtomicUsize,
}

impl TestInstantiator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupInstantiator for TestInstantiator {
    async fn new_instance(
        &self,
        object: ObjectId,
        desc: &ObjectDesc,
    ) -> Result<MarshalledProxy, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        MarshalledProxy::marshal(&format!("{}:{object}", desc.class_name))
            .map_err(|e| CallError::unmarshal_failed(e.to_string()))
    }
}

fn test_config(dir: &Path) -> StokerConfig {
    let mut config = StokerConfig::default();
    config.daemon.state_dir = dir.join("state");
    config.daemon.group_timeout = Duration::from_secs(5);
    config.groups.command = "/bin/sh".to_string();
    config.groups.options = vec!["-c".to_string(), "sleep 30".to_string()];
    config
}

async fn wait_for(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn has_child(daemon: &ActivationDaemon, group: GroupId) -> bool {
    daemon.live_children().iter().any(|(g, _)| *g == group)
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn activation_caches_until_told_otherwise() {
    let dir = TempDir::new().unwrap();
    let daemon = ActivationDaemon::recover(test_config(dir.path())).unwrap();
    let group = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object = daemon
        .register_object(group, ObjectDesc::new("cache.Impl"))
        .await
        .unwrap();

    let instantiator = TestInstantiator::new();
    let worker = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object, false).await })
    };
    wait_for("first child to spawn", || has_child(&daemon, group)).await;
    daemon
        .active_group(group, 1, instantiator.clone())
        .await
        .unwrap();
    let proxy = worker.await.unwrap().unwrap();
    assert_eq!(instantiator.calls(), 1);

    // Second activation is served from the cache without touching the
    // group.
    let again = daemon.activate(object, false).await.unwrap();
    assert_eq!(again, proxy);
    assert_eq!(instantiator.calls(), 1);

    // Dropping the cache sends the next activation back to the group.
    daemon.inactive_object(object).await.unwrap();
    daemon.activate(object, false).await.unwrap();
    assert_eq!(instantiator.calls(), 2);

    // Forcing always bypasses the cache.
    daemon.activate(object, true).await.unwrap();
    assert_eq!(instantiator.calls(), 3);

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn group_creation_is_throttled() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.daemon.group_throttle = 1;
    let daemon = ActivationDaemon::recover(config).unwrap();

    let group_a = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object_a = daemon
        .register_object(group_a, ObjectDesc::new("a.Impl"))
        .await
        .unwrap();
    let group_b = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object_b = daemon
        .register_object(group_b, ObjectDesc::new("b.Impl"))
        .await
        .unwrap();

    let task_a = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object_a, false).await })
    };
    wait_for("group A to spawn", || has_child(&daemon, group_a)).await;

    let task_b = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object_b, false).await })
    };

    // With one throttle slot, B's exec must not start while A is still
    // inside its exec-plus-handshake window.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(has_child(&daemon, group_a));
    assert!(
        !has_child(&daemon, group_b),
        "second group spawned while the first held the only throttle slot"
    );

    let inst_a = TestInstantiator::new();
    daemon.active_group(group_a, 1, inst_a).await.unwrap();
    task_a.await.unwrap().unwrap();

    wait_for("group B to spawn after A finished", || {
        has_child(&daemon, group_b)
    })
    .await;
    let inst_b = TestInstantiator::new();
    daemon.active_group(group_b, 1, inst_b).await.unwrap();
    task_b.await.unwrap().unwrap();

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn crashed_group_restarts_flagged_objects_once() {
    let dir = TempDir::new().unwrap();
    let daemon = ActivationDaemon::recover(test_config(dir.path())).unwrap();
    let group = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object = daemon
        .register_object(group, ObjectDesc::restartable("svc.Impl"))
        .await
        .unwrap();

    let instantiator = TestInstantiator::new();
    let worker = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object, false).await })
    };
    wait_for("first incarnation to spawn", || has_child(&daemon, group)).await;
    daemon
        .active_group(group, 1, instantiator.clone())
        .await
        .unwrap();
    worker.await.unwrap().unwrap();
    assert_eq!(instantiator.calls(), 1);

    // Kill the child out from under the daemon. The watchdog must reset
    // the group and re-activate the restart-flagged object, exactly
    // once, under a fresh incarnation.
    let pid = daemon.live_children()[0].1;
    #[allow(clippy::cast_possible_wrap)]
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while daemon.group_incarnation(group).await.unwrap() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "restart never spawned a second incarnation"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    daemon
        .active_group(group, 2, instantiator.clone())
        .await
        .unwrap();

    wait_for("restart to re-instantiate the object", || {
        instantiator.calls() >= 2
    })
    .await;
    // Settle, then confirm the crash produced exactly one extra
    // instantiation and no duplicate restart cycle.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(instantiator.calls(), 2);
    assert_eq!(daemon.group_incarnation(group).await.unwrap(), 2);

    // A callback from the dead incarnation is refused.
    let stale = TestInstantiator::new();
    let err = daemon.active_group(group, 1, stale).await.unwrap_err();
    assert!(matches!(
        err,
        ActivationError::StaleIncarnation {
            presented: 1,
            current: 2,
            ..
        }
    ));

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn silent_child_times_out_and_is_destroyed() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.daemon.group_timeout = Duration::from_millis(400);
    let daemon = ActivationDaemon::recover(config).unwrap();
    let group = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object = daemon
        .register_object(group, ObjectDesc::new("quiet.Impl"))
        .await
        .unwrap();

    // The sh child never calls active_group, so the handshake must time
    // out and the half-started child must be destroyed.
    let err = daemon.activate(object, false).await.unwrap_err();
    assert!(matches!(err, ActivationError::GroupTimeout { .. }));
    wait_for("abandoned child to be reaped", || {
        daemon.live_children().is_empty()
    })
    .await;

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn shutdown_reaps_children_and_refuses_new_work() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let state_dir = config.daemon.state_dir.clone();
    let daemon = ActivationDaemon::recover(config).unwrap();
    let group = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object = daemon
        .register_object(group, ObjectDesc::new("svc.Impl"))
        .await
        .unwrap();

    let instantiator = TestInstantiator::new();
    let worker = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object, false).await })
    };
    wait_for("child to spawn", || has_child(&daemon, group)).await;
    daemon
        .active_group(group, 1, instantiator.clone())
        .await
        .unwrap();
    worker.await.unwrap().unwrap();

    daemon.shutdown().await;
    assert!(daemon.live_children().is_empty());
    assert!(matches!(
        daemon.register_group(GroupDesc::default()).await,
        Err(ActivationError::ShuttingDown)
    ));
    assert!(
        state_dir.join("snapshot.json").exists(),
        "shutdown must leave a final snapshot behind"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(miri, ignore)] // Miri can't spawn processes
async fn unregistering_a_group_kills_its_child() {
    let dir = TempDir::new().unwrap();
    let daemon = ActivationDaemon::recover(test_config(dir.path())).unwrap();
    let group = daemon.register_group(GroupDesc::default()).await.unwrap();
    let object = daemon
        .register_object(group, ObjectDesc::new("gone.Impl"))
        .await
        .unwrap();

    let instantiator = TestInstantiator::new();
    let worker = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.activate(object, false).await })
    };
    wait_for("child to spawn", || has_child(&daemon, group)).await;
    daemon
        .active_group(group, 1, instantiator)
        .await
        .unwrap();
    worker.await.unwrap().unwrap();

    daemon.unregister_group(group).await.unwrap();
    wait_for("orphaned child to be reaped", || {
        daemon.live_children().is_empty()
    })
    .await;
    assert!(matches!(
        daemon.activate(object, false).await,
        Err(ActivationError::UnknownObject { .. })
    ));

    daemon.shutdown().await;
}
