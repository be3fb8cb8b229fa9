/*!
Shutdown sequencer.

Drains the child table with escalation:

`Draining` (up to the wait-for-children timeout) → `Interrupting` (SIGINT, then drain for the
grace period) → `Killing` (SIGKILL, then drain for the grace period) → `ForceClosing`
(close connections and delete directories of anything still tracked) → `Done`.

Each phase is skipped as soon as the table is empty.
*/
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::children::ChildTable;
use crate::reaper;
use crate::util::fs::remove_dir_if_exists;

/// Pause between reaper polls while draining.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Draining,
    Interrupting,
    Killing,
    ForceClosing,
    Done,
}

/// What the sequencer had to do to empty the table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub interrupted: Vec<Pid>,
    pub killed: Vec<Pid>,
    /// Children that survived SIGKILL and were forcibly forgotten.
    pub immortal: Vec<Pid>,
}

impl ShutdownReport {
    pub fn clean(&self) -> bool {
        self.interrupted.is_empty() && self.killed.is_empty() && self.immortal.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSequencer {
    wait_timeout: Duration,
    grace: Duration,
    poll_interval: Duration,
}

impl ShutdownSequencer {
    pub fn new(wait_timeout: Duration, grace: Duration) -> Self {
        ShutdownSequencer {
            wait_timeout,
            grace,
            poll_interval: DRAIN_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Longest time `run` can take before force-closing, excluding the force-close itself.
    pub fn worst_case(&self) -> Duration {
        self.wait_timeout + self.grace * 2
    }

    /// Run the state machine until the table is empty or force-cleaned.
    pub fn run(&self, children: &mut ChildTable) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let mut phase = Phase::Draining;
        loop {
            phase = match phase {
                Phase::Draining => {
                    if !children.is_empty() {
                        info!(
                            "waiting up to {:?} for {} children to exit",
                            self.wait_timeout,
                            children.len()
                        );
                    }
                    self.drain(children, self.wait_timeout);
                    self.next_or_done(children, Phase::Interrupting)
                }
                Phase::Interrupting => {
                    report.interrupted = signal_all(children, Signal::SIGINT);
                    self.drain(children, self.grace);
                    self.next_or_done(children, Phase::Killing)
                }
                Phase::Killing => {
                    report.killed = signal_all(children, Signal::SIGKILL);
                    self.drain(children, self.grace);
                    self.next_or_done(children, Phase::ForceClosing)
                }
                Phase::ForceClosing => {
                    report.immortal = force_close(children);
                    Phase::Done
                }
                Phase::Done => return report,
            };
        }
    }

    fn next_or_done(&self, children: &ChildTable, next: Phase) -> Phase {
        if children.is_empty() {
            Phase::Done
        } else {
            next
        }
    }

    /// Poll the reaper until the table empties or `limit` elapses.
    fn drain(&self, children: &mut ChildTable, limit: Duration) {
        let deadline = Instant::now() + limit;
        loop {
            reaper::reap(children);
            if children.is_empty() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

fn signal_all(children: &ChildTable, sig: Signal) -> Vec<Pid> {
    let pids = children.pids();
    for pid in &pids {
        warn!("sending {sig} to child {pid}");
        if let Err(e) = kill(*pid, sig) {
            warn!("failed to send {sig} to child {pid}: {e}");
        }
    }
    pids
}

fn force_close(children: &mut ChildTable) -> Vec<Pid> {
    let mut immortal = Vec::new();
    for record in children.drain() {
        error!(
            "child {} survived SIGKILL; closing its connection and removing {}",
            record.pid,
            record.dir.display()
        );
        let _ = record.conn.shutdown(std::net::Shutdown::Both);
        if let Err(e) = remove_dir_if_exists(&record.dir) {
            warn!("failed to remove {}: {e}", record.dir.display());
        }
        immortal.push(record.pid);
    }
    immortal
}
