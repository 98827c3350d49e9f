//! Child process construction for activation groups.
//!
//! The daemon execs one worker process per activation group. The command
//! line is assembled from the daemon-wide groups configuration and the
//! group's own descriptor, and the group's identity is handed to the
//! child as a single JSON bootstrap line on stdin. The child answers by
//! calling back `active_group` with its incarnation and instantiator
//! reference.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::config::GroupsSection;
use crate::group::{GroupDesc, GroupId};

/// Identity and parameters handed to a freshly spawned group process on
/// stdin, one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBootstrap {
    /// The group this process hosts.
    pub group: GroupId,
    /// Incarnation the child must echo back in `active_group`. A crashed
    /// predecessor's late callback carries an older value and is refused.
    pub incarnation: u64,
    /// Effective code location, group descriptor first, daemon-wide
    /// default second.
    #[serde(default)]
    pub location: Option<String>,
    /// The group descriptor itself.
    pub desc: GroupDesc,
}

/// A live group child plus the pid it was observed under.
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Assemble the command line for a group process.
///
/// Argument order is fixed: daemon-wide leading options, then the
/// group's own options, then its properties as `-Dkey=value` in key
/// order, then the daemon-wide trailing options.
#[must_use]
pub fn build_command(section: &GroupsSection, desc: &GroupDesc) -> Command {
    let program = desc
        .command
        .clone()
        .unwrap_or_else(|| section.command.clone());
    let mut cmd = Command::new(program);
    cmd.args(&section.options);
    cmd.args(&desc.options);
    for (key, value) in &desc.properties {
        cmd.arg(format!("-D{key}={value}"));
    }
    cmd.args(&section.config_options);
    cmd
}

/// Spawn a group process and deliver its bootstrap line.
///
/// The child's stdin is closed once the bootstrap is written; stdout and
/// stderr are discarded. The returned handle kills the child when
/// dropped.
pub async fn spawn_group(
    section: &GroupsSection,
    desc: &GroupDesc,
    bootstrap: &GroupBootstrap,
) -> std::io::Result<SpawnedChild> {
    let mut cmd = build_command(section, desc);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| std::io::Error::other("group process exited before its pid was read"))?;

    let line = serde_json::to_string(bootstrap).map_err(std::io::Error::other)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        // Dropping the handle closes the pipe.
    }

    debug!(group = %bootstrap.group, incarnation = bootstrap.incarnation, pid, "group process spawned");
    Ok(SpawnedChild { child, pid })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ffi::OsStr;

    use super::*;

    fn section() -> GroupsSection {
        GroupsSection {
            command: "stoker-group".to_string(),
            options: vec!["--quiet".to_string()],
            config_options: vec!["--trailing".to_string()],
            location: None,
        }
    }

    #[test]
    fn argument_order_is_options_then_group_then_properties_then_trailing() {
        let mut properties = BTreeMap::new();
        properties.insert("zeta".to_string(), "2".to_string());
        properties.insert("alpha".to_string(), "1".to_string());
        let desc = GroupDesc {
            command: None,
            options: vec!["--group-opt".to_string()],
            properties,
            location: None,
        };

        let cmd = build_command(&section(), &desc);
        assert_eq!(cmd.as_std().get_program(), OsStr::new("stoker-group"));
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(
            args,
            [
                OsStr::new("--quiet"),
                OsStr::new("--group-opt"),
                OsStr::new("-Dalpha=1"),
                OsStr::new("-Dzeta=2"),
                OsStr::new("--trailing"),
            ]
        );
    }

    #[test]
    fn group_command_overrides_daemon_default() {
        let desc = GroupDesc {
            command: Some("/opt/custom-runner".to_string()),
            ..GroupDesc::default()
        };
        let cmd = build_command(&section(), &desc);
        assert_eq!(cmd.as_std().get_program(), OsStr::new("/opt/custom-runner"));
    }

    #[test]
    fn bootstrap_line_round_trips() {
        let bootstrap = GroupBootstrap {
            group: GroupId::random(),
            incarnation: 3,
            location: Some("https://codebase.example/worker".to_string()),
            desc: GroupDesc::default(),
        };
        let line = serde_json::to_string(&bootstrap).unwrap();
        let back: GroupBootstrap = serde_json::from_str(&line).unwrap();
        assert_eq!(back, bootstrap);
    }
}
