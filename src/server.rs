/*!
Control socket server.

- Binds the Unix socket (after taking the per-socket instance lock), applies the mode bits and
  switches the listener to non-blocking.
- The loop polls the listener next to the signal self-pipe, bounded by the accept timeout, so
  SIGCHLD and SIGTERM wake it immediately.
- Each accepted connection is handled synchronously: one request read under the request
  timeout, then dispatch. Fork requests hand the connection to the child table.
- After every iteration the reaper runs; once termination is requested the socket is
  unbound and removed and the shutdown sequencer drains the children.
*/
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use crate::children::ChildTable;
use crate::config::ServiceConfig;
use crate::errors::ServiceError;
use crate::executor::Executor;
use crate::lock::{acquire_lock_at, InstanceLock};
use crate::protocol::{self, EnvOverlay, ParsedRequest};
use crate::reaper;
use crate::shutdown::{ShutdownReport, ShutdownSequencer};
use crate::signals::{self, SignalWaker};
use crate::spawner::{self, Spawn};
use crate::util::fs::remove_dir_if_exists;
use crate::util::shell_join;

/// Runtime state of one service instance, alive from bind until the socket is removed.
#[derive(Debug)]
pub struct ServiceState {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub started_at: Instant,
    pub should_terminate: bool,
    /// Forks attempted since start.
    pub spawned: u64,
    listener: Option<UnixListener>,
}

impl ServiceState {
    /// Remove a stale socket file and bind a fresh listener with `mode` applied.
    pub fn bind(socket_path: &Path, mode: u32) -> Result<Self, ServiceError> {
        remove_stale_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path).map_err(|e| {
            ServiceError::Message(format!("cannot bind {}: {e}", socket_path.display()))
        })?;
        let state = ServiceState {
            socket_path: socket_path.to_path_buf(),
            socket_mode: mode,
            started_at: Instant::now(),
            should_terminate: false,
            spawned: 0,
            listener: Some(listener),
        };
        fs::set_permissions(socket_path, fs::Permissions::from_mode(mode)).map_err(|e| {
            state.remove_socket_file();
            ServiceError::Message(format!(
                "cannot set mode {mode:o} on {}: {e}",
                socket_path.display()
            ))
        })?;
        if let Some(l) = &state.listener {
            l.set_nonblocking(true)?;
        }
        Ok(state)
    }

    pub fn listener(&self) -> Option<&UnixListener> {
        self.listener.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop accepting and remove the socket file.
    ///
    /// Explicit rather than on drop: a forked child owns a copy of this state and must never
    /// unlink the service's socket.
    pub fn unbind(&mut self) {
        if self.listener.take().is_some() {
            self.remove_socket_file();
            info!("stopped listening on {}", self.socket_path.display());
        }
    }

    fn remove_socket_file(&self) {
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", self.socket_path.display()),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), ServiceError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("removing stale socket {}", path.display());
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(ServiceError::Message(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// What woke the loop.
#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    listener: bool,
    signal: bool,
}

/// The forking service: owns the configuration, the executor run in children and the child
/// table.
pub struct ForkingService<E: Executor> {
    config: ServiceConfig,
    executor: E,
    children: ChildTable,
}

impl<E: Executor> ForkingService<E> {
    pub fn new(config: ServiceConfig, executor: E) -> Result<Self, ServiceError> {
        config.validate()?;
        Ok(ForkingService {
            config,
            executor,
            children: ChildTable::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn children(&self) -> &ChildTable {
        &self.children
    }

    /// Serve until `quit` or SIGTERM, then drain the children.
    ///
    /// Only startup failures (lock, bind, signal registration) are returned as errors.
    pub fn serve(&mut self) -> Result<ShutdownReport, ServiceError> {
        let lock = acquire_lock_at(&self.config.lock_path())?;
        let mut state = ServiceState::bind(&self.config.socket_path, self.config.socket_mode)?;
        let waker = match SignalWaker::install() {
            Ok(w) => w,
            Err(e) => {
                state.unbind();
                return Err(e.into());
            }
        };
        info!(
            "forking service listening on {} (mode {:o}, pid {})",
            state.socket_path.display(),
            state.socket_mode,
            std::process::id()
        );

        while !state.should_terminate {
            let ready = self.wait_ready(&state, &waker);
            if ready.signal {
                waker.drain();
            }
            if ready.listener {
                self.accept_one(&mut state, &waker, &lock);
            }
            reaper::reap(&mut self.children);
            if signals::terminate_requested() && !state.should_terminate {
                info!("SIGTERM received; shutting down");
                state.should_terminate = true;
            }
        }

        state.unbind();
        waker.uninstall();
        info!(
            "shutting down after {} spawns; {} children still running",
            state.spawned,
            self.children.len()
        );
        let report = ShutdownSequencer::new(
            self.config.wait_for_children_timeout,
            self.config.shutdown_grace,
        )
        .run(&mut self.children);
        drop(lock);
        info!("forking service stopped");
        Ok(report)
    }

    fn wait_ready(&self, state: &ServiceState, waker: &SignalWaker) -> Readiness {
        let Some(listener) = state.listener() else {
            return Readiness::default();
        };
        let ms = i32::try_from(self.config.accept_timeout.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX);
        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(waker.fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, timeout) {
            Ok(0) => Readiness::default(),
            Ok(_) => Readiness {
                listener: fds[0].revents().is_some_and(|r| !r.is_empty()),
                signal: fds[1].revents().is_some_and(|r| !r.is_empty()),
            },
            Err(Errno::EINTR) => Readiness::default(),
            Err(e) => {
                warn!("poll failed: {e}");
                Readiness::default()
            }
        }
    }

    fn accept_one(&mut self, state: &mut ServiceState, waker: &SignalWaker, lock: &InstanceLock) {
        let Some(listener) = state.listener() else {
            return;
        };
        let conn = match listener.accept() {
            Ok((conn, _addr)) => conn,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return;
            }
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };
        if let Err(e) = conn.set_nonblocking(false) {
            warn!("cannot make connection blocking: {e}");
            return;
        }
        self.handle_connection(state, conn, waker, lock);
    }

    fn handle_connection(
        &mut self,
        state: &mut ServiceState,
        mut conn: UnixStream,
        waker: &SignalWaker,
        lock: &InstanceLock,
    ) {
        let request = match protocol::read_request(&conn, self.config.request_timeout) {
            Ok(r) => r,
            Err(e) => {
                warn!("rejecting request: {e}");
                protocol::send_best_effort(&mut conn, &protocol::failure_response(&e.to_string()));
                return;
            }
        };
        match protocol::parse_request(&request) {
            Ok(ParsedRequest::Hello) => {
                debug!("request: hello");
                protocol::send_best_effort(&mut conn, protocol::HELLO_RESPONSE);
                self.log_status(state);
            }
            Ok(ParsedRequest::Quit) => {
                info!("request: quit");
                protocol::send_best_effort(&mut conn, protocol::QUIT_RESPONSE);
                state.should_terminate = true;
            }
            Ok(ParsedRequest::Fork { argv, env }) => {
                self.fork(state, conn, argv, env, waker, lock);
            }
            Ok(ParsedRequest::Unknown(raw)) => {
                warn!("unknown request: {raw:?}");
                protocol::send_best_effort(&mut conn, &protocol::unknown_request_response(&raw));
            }
            Err(e) => {
                warn!("unparseable request: {e}");
                protocol::send_best_effort(&mut conn, &protocol::parse_failure_response(&e));
            }
        }
    }

    fn fork(
        &mut self,
        state: &mut ServiceState,
        mut conn: UnixStream,
        argv: Vec<String>,
        env: EnvOverlay,
        waker: &SignalWaker,
        lock: &InstanceLock,
    ) {
        let dir = match spawner::create_child_dir(&self.config.temp_dir, &self.config.temp_dir_prefix)
        {
            Ok(d) => d,
            Err(e) => {
                error!("cannot create child directory in {}: {e}", self.config.temp_dir.display());
                protocol::send_best_effort(
                    &mut conn,
                    &protocol::failure_response(&format!("cannot create child directory: {e}")),
                );
                return;
            }
        };
        state.spawned += 1;

        let mut inherited = self.children.connection_fds();
        inherited.extend(waker.raw_fds());
        inherited.push(lock.raw_fd());
        if let Some(l) = state.listener() {
            inherited.push(l.as_raw_fd());
        }

        let command = shell_join(&argv);
        // Keep a handle so the parent can still answer if fork itself fails.
        let reply = conn.try_clone();
        match spawner::spawn(
            argv,
            env,
            conn,
            dir.clone(),
            self.config.child_connect_timeout,
            inherited,
        ) {
            Ok(Spawn::Parent(record)) => {
                info!("spawned child {} in {}: {command}", record.pid, dir.display());
                if let Some(stale) = self.children.insert(record) {
                    warn!("pid {} was still tracked; retiring the stale record", stale.pid);
                    reaper::finish(stale, reaper::ExitOutcome::Lost);
                }
            }
            Ok(Spawn::Child(ctx)) => {
                drop(reply);
                spawner::run_child(ctx, &self.executor)
            }
            Err(e) => {
                error!("fork failed for {command}: {e}");
                if let Ok(mut c) = reply {
                    protocol::send_best_effort(
                        &mut c,
                        &protocol::failure_response(&format!("fork failed: {e}")),
                    );
                }
                if let Err(e) = remove_dir_if_exists(&dir) {
                    warn!("failed to remove {}: {e}", dir.display());
                }
            }
        }
    }

    fn log_status(&self, state: &ServiceState) {
        info!(
            "status: up {}, {} children running, {} spawned",
            humantime::format_duration(Duration::from_secs(state.uptime().as_secs())),
            self.children.len(),
            state.spawned
        );
        for record in self.children.iter() {
            info!(
                "  child {} in {} (age {})",
                record.pid,
                record.dir().display(),
                humantime::format_duration(Duration::from_secs(record.age().as_secs()))
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_applies_mode_and_unbind_removes_socket() {
        let td = tempfile::tempdir().expect("tmpdir");
        let sock = td.path().join("svc.sock");
        let mut state = ServiceState::bind(&sock, 0o600).expect("bind");
        let meta = fs::metadata(&sock).expect("stat");
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
        assert_eq!(state.spawned, 0);
        assert!(!state.should_terminate);

        state.unbind();
        assert!(state.listener().is_none());
        assert!(!sock.exists());
    }

    #[test]
    fn test_bind_replaces_stale_socket_but_not_regular_file() {
        let td = tempfile::tempdir().expect("tmpdir");
        let sock = td.path().join("stale.sock");
        let stale = UnixListener::bind(&sock).expect("stale bind");
        drop(stale);
        assert!(sock.exists());
        let mut state = ServiceState::bind(&sock, 0o660).expect("rebind over stale socket");
        state.unbind();

        let file = td.path().join("not-a-socket");
        fs::write(&file, b"keep me").expect("write");
        let err = ServiceState::bind(&file, 0o660).expect_err("must refuse regular file");
        assert!(err.to_string().contains("not a socket"), "{err}");
        assert_eq!(fs::read(&file).expect("read"), b"keep me");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = ServiceConfig {
            accept_timeout: Duration::ZERO,
            ..ServiceConfig::default()
        };
        let ex = |_: &[String], _: &EnvOverlay| 0;
        assert!(ForkingService::new(cfg, ex).is_err());
    }
}
