/*!
Child bookkeeping: one `ChildRecord` per live forked worker, keyed by pid.

The table is only ever touched from the service's single loop (spawner, reaper and
shutdown sequencer), so it carries no locking.
*/
use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::unistd::Pid;

/// A forked worker the service is still responsible for.
#[derive(Debug)]
pub struct ChildRecord {
    pub pid: Pid,
    /// Temp directory holding the rendezvous FIFOs.
    pub dir: PathBuf,
    /// The requesting connection; the exit notification is written here.
    pub conn: UnixStream,
    pub started: SystemTime,
}

impl ChildRecord {
    pub fn new(pid: Pid, dir: PathBuf, conn: UnixStream) -> Self {
        ChildRecord {
            pid,
            dir,
            conn,
            started: SystemTime::now(),
        }
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started)
            .unwrap_or(Duration::ZERO)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Debug, Default)]
pub struct ChildTable {
    children: BTreeMap<Pid, ChildRecord>,
}

impl ChildTable {
    pub fn new() -> Self {
        ChildTable::default()
    }

    /// Register a record. A record already present under the same pid is returned
    /// (the kernel recycled a pid we never reaped); the caller decides what to do with it.
    pub fn insert(&mut self, record: ChildRecord) -> Option<ChildRecord> {
        self.children.insert(record.pid, record)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ChildRecord> {
        self.children.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Snapshot of the tracked pids in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        self.children.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.children.values()
    }

    /// Connection descriptors held on behalf of children; a new child must close these.
    pub fn connection_fds(&self) -> Vec<RawFd> {
        self.children.values().map(|r| r.conn.as_raw_fd()).collect()
    }

    /// Remove and return every record.
    pub fn drain(&mut self) -> Vec<ChildRecord> {
        std::mem::take(&mut self.children).into_values().collect()
    }
}
