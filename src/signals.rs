/*!
Signal plumbing for the service loop.

- SIGCHLD writes one byte into a non-blocking self-pipe; the loop polls the read end next to
  the listening socket and reaps once it becomes readable. The handler does nothing else.
- SIGTERM raises a termination flag, wakes the loop the same way, and is installed with
  `SA_RESETHAND` so a second SIGTERM takes the default action and kills the process.
- A forked child restores default dispositions before doing anything else; the handlers
  belong to the service process only.
*/
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigchld(_sig: libc::c_int) {
    wake_from_handler();
}

extern "C" fn handle_sigterm(_sig: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
    wake_from_handler();
}

extern "C" fn handle_sigalrm(_sig: libc::c_int) {}

fn wake_from_handler() {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // write(2) is async-signal-safe; a full pipe already guarantees a wakeup.
        let byte: u8 = 1;
        unsafe {
            let _ = libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// True once SIGTERM has been delivered to this process.
pub fn terminate_requested() -> bool {
    TERMINATE_REQUESTED.load(Ordering::SeqCst)
}

/// Self-pipe owning the SIGCHLD/SIGTERM handlers for as long as it is installed.
#[derive(Debug)]
pub struct SignalWaker {
    read_end: File,
    write_end: OwnedFd,
}

impl SignalWaker {
    /// Create the pipe and install the SIGCHLD and SIGTERM handlers.
    pub fn install() -> io::Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        WAKE_FD.store(write_end.as_raw_fd(), Ordering::SeqCst);
        TERMINATE_REQUESTED.store(false, Ordering::SeqCst);

        let act_chld = SigAction::new(
            SigHandler::Handler(handle_sigchld),
            SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let act_term = SigAction::new(
            SigHandler::Handler(handle_sigterm),
            SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signal::SIGCHLD, &act_chld)?;
            signal::sigaction(Signal::SIGTERM, &act_term)?;
        }
        Ok(SignalWaker {
            read_end: File::from(read_end),
            write_end,
        })
    }

    /// Descriptor to poll for readability.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    /// Both pipe descriptors; a forked child closes them.
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.read_end.as_raw_fd(), self.write_end.as_raw_fd()]
    }

    /// Consume pending wakeups. Returns the number of bytes drained.
    pub fn drain(&self) -> usize {
        let mut total = 0;
        let mut buf = [0u8; 64];
        let mut reader = &self.read_end;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        total
    }

    /// Restore default dispositions and stop writing to the pipe.
    pub fn uninstall(self) {
        WAKE_FD.store(-1, Ordering::SeqCst);
        reset_dispositions();
    }
}

fn reset_dispositions() {
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(Signal::SIGCHLD, &dfl);
        let _ = signal::sigaction(Signal::SIGTERM, &dfl);
    }
}

/// Child side: drop the service's handlers. The pipe descriptors are closed separately.
pub fn reset_in_child() {
    WAKE_FD.store(-1, Ordering::SeqCst);
    TERMINATE_REQUESTED.store(false, Ordering::SeqCst);
    reset_dispositions();
}

/// Arm `alarm(2)` so a blocking open in the child returns EINTR after `secs`.
///
/// SIGALRM gets a no-op handler without `SA_RESTART`; a zero duration disarms.
pub fn arm_alarm(secs: u32) -> io::Result<()> {
    if secs == 0 {
        nix::unistd::alarm::cancel();
        return Ok(());
    }
    let act = SigAction::new(
        SigHandler::Handler(handle_sigalrm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGALRM, &act)?;
    }
    nix::unistd::alarm::set(secs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_drain_counts_and_empties_pipe() {
        let (read_end, write_end) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).expect("pipe");
        let waker = SignalWaker {
            read_end: File::from(read_end),
            write_end,
        };
        let mut w = File::from(waker.write_end.try_clone().expect("dup"));
        w.write_all(b"abc").expect("write");
        assert_eq!(waker.drain(), 3);
        assert_eq!(waker.drain(), 0);
    }
}
