/*!
Reaper: collect exited children without blocking and tell their requesters.

Each tracked pid is polled with `waitpid(pid, WNOHANG)`. Waiting per pid rather than on
any child keeps the reaper from collecting processes the embedding application forked for
its own purposes.

`ECHILD` for a tracked pid means its status is gone for good (someone else reaped it, or
the pid was never ours). The record is retired as if the child had exited with an unknown
status: no `exited` line is sent, the connection is closed and the directory removed, so the
table cannot keep a phantom entry that would stall shutdown.
*/
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::children::{ChildRecord, ChildTable};
use crate::protocol;
use crate::util::fs::remove_dir_if_exists;

/// How a reaped child ended, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit code, or the negated signal number for a child killed by a signal.
    Code(i32),
    /// The wait status could not be collected.
    Lost,
}

/// Non-blocking poll of one pid. `None` while the child is still running.
pub fn poll_child(pid: Pid) -> Option<ExitOutcome> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Some(ExitOutcome::Code(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Some(ExitOutcome::Code(-(sig as i32))),
            Ok(_) => return None,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Some(ExitOutcome::Lost),
            Err(e) => {
                warn!("waitpid({pid}) failed: {e}");
                return None;
            }
        }
    }
}

/// Reap every tracked child that has exited. Returns how many records were retired.
pub fn reap(children: &mut ChildTable) -> usize {
    let mut reaped = 0;
    for pid in children.pids() {
        let Some(outcome) = poll_child(pid) else {
            continue;
        };
        if let Some(record) = children.remove(pid) {
            finish(record, outcome);
            reaped += 1;
        }
    }
    reaped
}

/// Deliver the exit notification for a removed record, close its connection and clean up.
pub fn finish(record: ChildRecord, outcome: ExitOutcome) {
    let ChildRecord {
        pid, dir, mut conn, ..
    } = record;
    match outcome {
        ExitOutcome::Code(code) => {
            info!("child {pid} exited with {code}");
            if !protocol::send_best_effort(&mut conn, &protocol::exited_response(code)) {
                debug!("child {pid}: requester already disconnected; exit status dropped");
            }
        }
        ExitOutcome::Lost => {
            warn!("child {pid} is no longer waitable (ECHILD); retiring it without an exit status");
        }
    }
    let _ = conn.shutdown(std::net::Shutdown::Both);
    drop(conn);

    match remove_dir_if_exists(&dir) {
        Ok(true) => warn!(
            "child {pid} exited without cleaning up; removed orphaned {}",
            dir.display()
        ),
        Ok(false) => {}
        Err(e) => warn!("failed to remove orphaned {} of child {pid}: {e}", dir.display()),
    }
}
