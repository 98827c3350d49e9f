//! Durable operation journal for the activation daemon.
//!
//! # Design
//!
//! Every mutating registry operation appends one [`LogRecord`] to an
//! append-only journal and fsyncs it *before* the in-memory tables are
//! touched. Recovery therefore never observes a mutation that was not
//! durably recorded first.
//!
//! Periodically (every `snapshot_threshold` records) the full table
//! state is written as a [`DaemonSnapshot`] to a sibling file via an
//! atomic rename, and the journal is truncated. Recovery is always
//! snapshot plus replay of whatever tail the journal still holds.
//!
//! # Crash-Replay Safety
//!
//! A torn final record (the typical result of crashing mid-append) is
//! truncated away on open and startup continues, because an operation
//! is only acknowledged after its fsync completed. Corruption anywhere
//! before the final record fails the open instead: that is not a torn
//! write but damaged history.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::group::{GroupDesc, GroupId, ObjectDesc, ObjectId};

const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error during append, fsync, or recovery.
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or invalid record before the journal's final line.
    #[error("corrupt journal record at line {line}: {reason}")]
    Corrupt {
        /// Line number where corruption was detected.
        line: usize,
        /// Description of the corruption.
        reason: String,
    },

    /// The snapshot file exists but cannot be decoded.
    #[error("corrupt snapshot: {reason}")]
    CorruptSnapshot { reason: String },

    /// Writing or persisting a snapshot failed.
    #[error("snapshot write failed: {reason}")]
    Snapshot { reason: String },
}

impl JournalError {
    /// Whether the daemon can no longer trust its persistence and must
    /// shut itself down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Snapshot { .. })
    }
}

/// One durable operation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    RegisterObject {
        object: ObjectId,
        group: GroupId,
        desc: ObjectDesc,
    },
    UnregisterObject {
        object: ObjectId,
    },
    RegisterGroup {
        group: GroupId,
        desc: GroupDesc,
    },
    UnregisterGroup {
        group: GroupId,
    },
    UpdateDesc {
        object: ObjectId,
        desc: ObjectDesc,
    },
    UpdateGroupDesc {
        group: GroupId,
        desc: GroupDesc,
    },
    GroupIncarnation {
        group: GroupId,
        incarnation: u64,
    },
}

/// Durable view of one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub desc: GroupDesc,
    #[serde(default)]
    pub incarnation: u64,
    #[serde(default)]
    pub objects: HashMap<ObjectId, ObjectDesc>,
}

/// Full durable state: the two registry tables, without any transient
/// runtime side (child handles, cached proxies, statuses).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    /// Object id to owning group.
    #[serde(default)]
    pub objects: HashMap<ObjectId, GroupId>,
    #[serde(default)]
    pub groups: HashMap<GroupId, GroupSnapshot>,
}

impl DaemonSnapshot {
    /// Apply one journaled operation. Replay is tolerant of records that
    /// reference state removed by a later snapshot boundary; those are
    /// logged and skipped rather than failing recovery.
    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::RegisterObject {
                object,
                group,
                desc,
            } => {
                let Some(entry) = self.groups.get_mut(group) else {
                    warn!(%object, %group, "replayed object registration for unknown group");
                    return;
                };
                entry.objects.insert(*object, desc.clone());
                self.objects.insert(*object, *group);
            }
            LogRecord::UnregisterObject { object } => {
                if let Some(group) = self.objects.remove(object) {
                    if let Some(entry) = self.groups.get_mut(&group) {
                        entry.objects.remove(object);
                    }
                }
            }
            LogRecord::RegisterGroup { group, desc } => {
                self.groups.insert(
                    *group,
                    GroupSnapshot {
                        desc: desc.clone(),
                        incarnation: 0,
                        objects: HashMap::new(),
                    },
                );
            }
            LogRecord::UnregisterGroup { group } => {
                self.groups.remove(group);
                self.objects.retain(|_, owner| owner != group);
            }
            LogRecord::UpdateDesc { object, desc } => {
                let Some(group) = self.objects.get(object) else {
                    warn!(%object, "replayed descriptor update for unknown object");
                    return;
                };
                if let Some(entry) = self.groups.get_mut(group) {
                    entry.objects.insert(*object, desc.clone());
                }
            }
            LogRecord::UpdateGroupDesc { group, desc } => {
                let Some(entry) = self.groups.get_mut(group) else {
                    warn!(%group, "replayed descriptor update for unknown group");
                    return;
                };
                entry.desc = desc.clone();
            }
            LogRecord::GroupIncarnation {
                group,
                incarnation,
            } => {
                let Some(entry) = self.groups.get_mut(group) else {
                    warn!(%group, "replayed incarnation bump for unknown group");
                    return;
                };
                entry.incarnation = *incarnation;
            }
        }
    }
}

/// Append-only journal plus snapshot management over one state
/// directory.
///
/// An exclusive advisory lock on the journal file is held for the
/// lifetime of this struct, so a second daemon pointed at the same state
/// directory fails its open instead of corrupting it.
pub struct Journal {
    dir: PathBuf,
    /// Append handle, exclusively locked for process lifetime.
    log: File,
    records_since_snapshot: usize,
    threshold: usize,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("dir", &self.dir)
            .field("records_since_snapshot", &self.records_since_snapshot)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Open the state directory, creating it if needed, and recover the
    /// durable state: snapshot first, then replay of the journal tail.
    pub fn open(dir: impl AsRef<Path>, threshold: usize) -> Result<(Self, DaemonSnapshot), JournalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let log_path = dir.join(JOURNAL_FILE);

        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .truncate(false)
            .append(true)
            .open(&log_path)?;
        log.try_lock_exclusive().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!(
                    "state directory is in use by another daemon ({}): {e}",
                    dir.display()
                ),
            )
        })?;

        let mut state = DaemonSnapshot::default();
        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let content = std::fs::read_to_string(&snapshot_path)?;
            state = serde_json::from_str(&content).map_err(|e| JournalError::CorruptSnapshot {
                reason: e.to_string(),
            })?;
        }

        // Replay the tail written since the snapshot. A parse failure on
        // the final line is a torn write from a crash mid-append and is
        // truncated away; anywhere earlier it is real damage. The tail
        // is read as raw bytes, since a tear can land inside a
        // multi-byte character.
        let mut truncate_to: Option<u64> = None;
        let mut replayed = 0usize;
        {
            let mut replay = log.try_clone()?;
            replay.seek(SeekFrom::Start(0))?;
            let mut reader = BufReader::new(&mut replay);
            let mut buf: Vec<u8> = Vec::new();
            let mut byte_offset: u64 = 0;
            let mut line = 0usize;
            loop {
                buf.clear();
                let consumed = reader.read_until(b'\n', &mut buf)?;
                if consumed == 0 {
                    break;
                }
                line += 1;
                let terminated = buf.ends_with(b"\n");
                let body = if terminated {
                    &buf[..buf.len() - 1]
                } else {
                    &buf[..]
                };
                if body.iter().all(u8::is_ascii_whitespace) {
                    byte_offset += consumed as u64;
                    continue;
                }
                if !terminated {
                    // Only newline-terminated records were ever
                    // acknowledged; an unterminated tail is torn even
                    // when its bytes happen to parse.
                    warn!(
                        line,
                        path = %log_path.display(),
                        "truncating unterminated tail record from journal"
                    );
                    truncate_to = Some(byte_offset);
                    break;
                }
                match serde_json::from_slice::<LogRecord>(body) {
                    Ok(record) => {
                        state.apply(&record);
                        replayed += 1;
                        byte_offset += consumed as u64;
                    }
                    Err(e) => {
                        if reader.fill_buf()?.is_empty() {
                            warn!(
                                line,
                                reason = %e,
                                path = %log_path.display(),
                                "truncating torn tail record from journal"
                            );
                            truncate_to = Some(byte_offset);
                            break;
                        }
                        return Err(JournalError::Corrupt {
                            line,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(pos) = truncate_to {
            let fixer = OpenOptions::new().write(true).open(&log_path)?;
            fixer.set_len(pos)?;
            fixer.sync_all()?;
        }

        debug!(
            dir = %dir.display(),
            replayed,
            groups = state.groups.len(),
            objects = state.objects.len(),
            "journal recovered"
        );

        Ok((
            Self {
                dir,
                log,
                records_since_snapshot: replayed,
                threshold,
            },
            state,
        ))
    }

    /// Durably append one record. Returns `Ok(true)` when enough records
    /// have accumulated that the caller should write a snapshot.
    ///
    /// The record is on disk (fsynced) before this returns, so the
    /// caller may apply the matching in-memory mutation afterwards.
    pub fn append(&mut self, record: &LogRecord) -> Result<bool, JournalError> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        writeln!(self.log, "{line}")?;
        self.log.sync_all()?;
        self.records_since_snapshot += 1;
        Ok(self.records_since_snapshot >= self.threshold)
    }

    /// Write a full snapshot atomically and truncate the journal.
    pub fn snapshot(&mut self, state: &DaemonSnapshot) -> Result<(), JournalError> {
        let encoded =
            serde_json::to_vec_pretty(state).map_err(|e| JournalError::Snapshot {
                reason: e.to_string(),
            })?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| JournalError::Snapshot {
            reason: format!("creating temp file: {e}"),
        })?;
        tmp.write_all(&encoded).map_err(|e| JournalError::Snapshot {
            reason: format!("writing temp file: {e}"),
        })?;
        tmp.as_file().sync_all().map_err(|e| JournalError::Snapshot {
            reason: format!("syncing temp file: {e}"),
        })?;
        tmp.persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| JournalError::Snapshot {
                reason: format!("persisting snapshot: {e}"),
            })?;

        self.log.set_len(0)?;
        self.log.sync_all()?;
        self.records_since_snapshot = 0;
        debug!(
            groups = state.groups.len(),
            objects = state.objects.len(),
            "snapshot written, journal truncated"
        );
        Ok(())
    }

    /// Records appended since the last snapshot (or open).
    #[must_use]
    pub fn records_since_snapshot(&self) -> usize {
        self.records_since_snapshot
    }

    /// The state directory this journal lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
