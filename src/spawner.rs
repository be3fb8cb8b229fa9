/*!
Rendezvous spawner.

`spawn` forks once. The parent gets a `ChildRecord` to track and returns to the service
loop immediately; the child gets a `ChildContext` and must hand it to `run_child`, which
never returns:

1. drop the service's signal handlers and inherited descriptors,
2. apply the environment overlay,
3. create `stdin`, `stdout`, `stderr` FIFOs in the child's temp directory,
4. send `ok\n<pid>\n<dir>\n` and close its copy of the connection,
5. block opening stdin (read) → stdout (write) → stderr (write) until the client does
   the matching opens,
6. rebind fds 0/1/2, remove the FIFOs and the directory,
7. run the executor, close the standard streams and `_exit(2)` with its code.

Only the child ever blocks on the FIFOs, so the service loop stays responsive.
*/
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult};
use tracing::{debug, warn};

use crate::children::ChildRecord;
use crate::errors::ServiceError;
use crate::executor::Executor;
use crate::protocol::{self, EnvOverlay};
use crate::signals;
use crate::util::fs::remove_dir_if_exists;

pub const STDIN_FIFO: &str = "stdin";
pub const STDOUT_FIFO: &str = "stdout";
pub const STDERR_FIFO: &str = "stderr";

/// Exit code of a child whose client never opened the FIFOs within the connect timeout.
pub const CONNECT_TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code of a child that failed before running the executor.
pub const SETUP_FAILURE_EXIT_CODE: i32 = 1;

/// Everything a freshly forked child needs; consumed by `run_child`.
#[derive(Debug)]
pub struct ChildContext {
    pub argv: Vec<String>,
    pub env: EnvOverlay,
    pub dir: PathBuf,
    pub conn: UnixStream,
    pub connect_timeout: Option<Duration>,
    /// Service descriptors the child must not keep open.
    pub inherited_fds: Vec<RawFd>,
}

/// The two sides of a successful fork.
#[derive(Debug)]
pub enum Spawn {
    Parent(ChildRecord),
    Child(ChildContext),
}

/// Create a fresh, uniquely named working directory for one child.
pub fn create_child_dir(base: &Path, prefix: &str) -> io::Result<PathBuf> {
    let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
    Ok(dir.keep())
}

/// Fork a worker for `argv`/`env` whose rendezvous directory is `dir`.
///
/// On failure nothing was forked; the caller still owns `dir` (via the error path it
/// should remove it) and the connection has been dropped.
pub fn spawn(
    argv: Vec<String>,
    env: EnvOverlay,
    conn: UnixStream,
    dir: PathBuf,
    connect_timeout: Option<Duration>,
    inherited_fds: Vec<RawFd>,
) -> Result<Spawn, ServiceError> {
    // The service is single-threaded, so the child starts with a consistent address space.
    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => Ok(Spawn::Parent(ChildRecord::new(child, dir, conn))),
        ForkResult::Child => Ok(Spawn::Child(ChildContext {
            argv,
            env,
            dir,
            conn,
            connect_timeout,
            inherited_fds,
        })),
    }
}

/// Child entry point. Terminates the process with the executor's exit code.
pub fn run_child<E: Executor + ?Sized>(ctx: ChildContext, executor: &E) -> ! {
    let code = panic::catch_unwind(AssertUnwindSafe(|| child_main(ctx, executor)))
        .unwrap_or(SETUP_FAILURE_EXIT_CODE);
    // Skip atexit handlers and destructors inherited from the service.
    unsafe { libc::_exit(code) }
}

fn child_main<E: Executor + ?Sized>(ctx: ChildContext, executor: &E) -> i32 {
    signals::reset_in_child();
    for fd in &ctx.inherited_fds {
        let _ = unistd::close(*fd);
    }

    let ChildContext {
        argv,
        env,
        dir,
        mut conn,
        connect_timeout,
        ..
    } = ctx;

    apply_env_overlay(&env);

    if let Err(e) = make_fifos(&dir) {
        warn!("child {}: creating FIFOs in {} failed: {e}", std::process::id(), dir.display());
        protocol::send_best_effort(
            &mut conn,
            &protocol::failure_response(&format!("failed to create FIFOs: {e}")),
        );
        let _ = remove_dir_if_exists(&dir);
        return SETUP_FAILURE_EXIT_CODE;
    }

    let pid = unistd::getpid().as_raw();
    if !protocol::send_best_effort(&mut conn, &protocol::fork_ok_response(pid, &dir)) {
        warn!("child {pid}: requester disconnected before the fork response");
        let _ = remove_dir_if_exists(&dir);
        return SETUP_FAILURE_EXIT_CODE;
    }
    drop(conn);

    let fds = match open_fifos(&dir, connect_timeout) {
        Ok(fds) => fds,
        Err(Errno::EINTR) => {
            warn!("child {pid}: client did not open the FIFOs in time; giving up");
            let _ = remove_dir_if_exists(&dir);
            return CONNECT_TIMEOUT_EXIT_CODE;
        }
        Err(e) => {
            warn!("child {pid}: opening FIFOs failed: {e}");
            let _ = remove_dir_if_exists(&dir);
            return SETUP_FAILURE_EXIT_CODE;
        }
    };
    debug!("child {pid}: client connected to {}", dir.display());

    // From here on fds 0-2 belong to the client; nothing else is logged.
    if rebind_stdio(fds).is_err() {
        let _ = remove_dir_if_exists(&dir);
        return SETUP_FAILURE_EXIT_CODE;
    }
    let _ = remove_dir_if_exists(&dir);

    let code = executor.execute(&argv, &env);
    close_stdio();
    code
}

fn apply_env_overlay(env: &EnvOverlay) {
    for (key, value) in env {
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
    }
}

fn make_fifos(dir: &Path) -> nix::Result<()> {
    for name in [STDIN_FIFO, STDOUT_FIFO, STDERR_FIFO] {
        unistd::mkfifo(&dir.join(name), Mode::S_IRUSR | Mode::S_IWUSR)?;
    }
    Ok(())
}

fn open_fifos(dir: &Path, connect_timeout: Option<Duration>) -> nix::Result<[RawFd; 3]> {
    if let Some(t) = connect_timeout {
        signals::arm_alarm(alarm_secs(t)).map_err(|_| Errno::EINVAL)?;
    }
    let order = [
        (STDIN_FIFO, OFlag::O_RDONLY),
        (STDOUT_FIFO, OFlag::O_WRONLY),
        (STDERR_FIFO, OFlag::O_WRONLY),
    ];
    let mut fds: [RawFd; 3] = [-1; 3];
    for (i, (name, flags)) in order.into_iter().enumerate() {
        match open_blocking(&dir.join(name), flags, connect_timeout.is_some()) {
            Ok(fd) => fds[i] = fd,
            Err(e) => {
                let _ = signals::arm_alarm(0);
                for fd in &fds[..i] {
                    let _ = unistd::close(*fd);
                }
                return Err(e);
            }
        }
    }
    let _ = signals::arm_alarm(0);
    Ok(fds)
}

/// `alarm(2)` has whole-second resolution; round up so the client never gets less time than
/// configured.
fn alarm_secs(t: Duration) -> u32 {
    let secs = t.as_secs() + u64::from(t.subsec_nanos() > 0);
    u32::try_from(secs.max(1)).unwrap_or(u32::MAX)
}

/// Open a FIFO, blocking until the peer opens the other end. EINTR is only surfaced when
/// a connect timeout is armed.
fn open_blocking(path: &Path, flags: OFlag, timed: bool) -> nix::Result<RawFd> {
    loop {
        match nix::fcntl::open(path, flags, Mode::empty()) {
            Err(Errno::EINTR) if !timed => continue,
            other => return other,
        }
    }
}

fn rebind_stdio(fds: [RawFd; 3]) -> nix::Result<()> {
    for (target, fd) in fds.into_iter().enumerate() {
        let target = target as RawFd;
        if fd != target {
            unistd::dup2(fd, target)?;
            let _ = unistd::close(fd);
        }
    }
    Ok(())
}

fn close_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    for fd in 0..=2 {
        let _ = unistd::close(fd);
    }
}
