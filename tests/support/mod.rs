/*!
Test support helpers shared across integration tests.

- Daemon::start(args): run the forking-service binary on a private socket and temp dir
- Session: one control connection with line-oriented reads
- open_fifos(dir): the client half of the FIFO rendezvous (stdin, stdout, stderr in order)

The daemon's stderr is captured to `daemon.log` inside its scratch directory; assertion
messages include it so failures are diagnosable.
*/
#![allow(dead_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wait_timeout::ChildExt;

pub struct Daemon {
    child: Child,
    pub socket: PathBuf,
    pub children_dir: PathBuf,
    tmp: TempDir,
}

impl Daemon {
    /// Start the daemon with short timeouts plus `extra` flags, and wait until it accepts.
    pub fn start(extra: &[&str]) -> Daemon {
        Self::start_with_env(extra, &[])
    }

    pub fn start_with_env(extra: &[&str], env: &[(&str, &str)]) -> Daemon {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let socket = tmp.path().join("svc.sock");
        let children_dir = tmp.path().join("children");
        fs::create_dir(&children_dir).expect("children dir");
        let log = File::create(tmp.path().join("daemon.log")).expect("log file");

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_forking-service"));
        cmd.arg("--socket")
            .arg(&socket)
            .arg("--temp-dir")
            .arg(&children_dir)
            .args(["--accept-timeout", "100ms"])
            .args(extra)
            .env("FORKING_SERVICE_LOG", "debug")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        for (k, v) in env {
            cmd.env(k, v);
        }
        let child = cmd.spawn().expect("spawn forking-service");
        let mut daemon = Daemon {
            child,
            socket,
            children_dir,
            tmp,
        };
        daemon.wait_until_listening();
        daemon
    }

    fn wait_until_listening(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if UnixStream::connect(&self.socket).is_ok() {
                // The probe connection is read as a closed partial request; harmless.
                return;
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                panic!("daemon exited early with {status}\n{}", self.log());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("daemon never started listening\n{}", self.log());
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut s = self.socket.clone().into_os_string();
        s.push(".lock");
        PathBuf::from(s)
    }

    pub fn scratch(&self) -> &Path {
        self.tmp.path()
    }

    pub fn log(&self) -> String {
        fs::read_to_string(self.tmp.path().join("daemon.log")).unwrap_or_default()
    }

    pub fn connect(&self) -> Session {
        Session::connect(&self.socket)
    }

    /// One request on a fresh connection; returns everything the daemon sent before closing.
    pub fn request(&self, req: &str) -> String {
        let mut s = self.connect();
        s.send(req);
        s.read_to_end()
    }

    pub fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        self.child.wait_timeout(timeout).expect("wait daemon")
    }

    pub fn sigterm(&self) {
        let pid = nix::unistd::Pid::from_raw(self.pid() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).expect("kill");
    }

    /// Names of entries currently in the per-child temp base.
    pub fn child_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.children_dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Response to a successful fork request.
#[derive(Debug)]
pub struct Forked {
    pub pid: i32,
    pub dir: PathBuf,
}

pub struct Session {
    reader: BufReader<UnixStream>,
}

impl Session {
    pub fn connect(socket: &Path) -> Session {
        let stream = UnixStream::connect(socket).expect("connect control socket");
        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .expect("read timeout");
        Session {
            reader: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, req: &str) {
        self.reader
            .get_mut()
            .write_all(req.as_bytes())
            .expect("send request");
    }

    /// Like `send`, but tolerate the daemon hanging up mid-write.
    pub fn try_send(&mut self, req: &str) -> bool {
        self.reader.get_mut().write_all(req.as_bytes()).is_ok()
    }

    pub fn half_close(&mut self) {
        let _ = self.reader.get_mut().shutdown(std::net::Shutdown::Write);
    }

    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read line");
        line
    }

    pub fn read_to_end(&mut self) -> String {
        let mut rest = String::new();
        self.reader.read_to_string(&mut rest).expect("read to end");
        rest
    }

    /// Read the three-line fork response.
    pub fn expect_forked(&mut self) -> Forked {
        let ok = self.read_line();
        assert_eq!(ok, "ok\n", "unexpected fork response");
        let pid: i32 = self.read_line().trim().parse().expect("pid line");
        assert!(pid > 0);
        let dir = PathBuf::from(self.read_line().trim_end_matches('\n'));
        Forked { pid, dir }
    }

    /// Read the exit notification and assert the connection is closed after it.
    pub fn expect_exited(&mut self) -> i32 {
        assert_eq!(self.read_line(), "exited\n");
        let code: i32 = self.read_line().trim().parse().expect("exit code line");
        assert_eq!(self.read_to_end(), "", "connection should close after exited");
        code
    }
}

pub struct ClientStdio {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

impl ClientStdio {
    /// Close stdin, then collect stdout and stderr until the worker closes them.
    pub fn finish(self) -> (String, String) {
        let ClientStdio {
            stdin,
            mut stdout,
            mut stderr,
        } = self;
        drop(stdin);
        let mut out = String::new();
        stdout.read_to_string(&mut out).expect("read stdout");
        let mut err = String::new();
        stderr.read_to_string(&mut err).expect("read stderr");
        (out, err)
    }
}

/// Client side of the rendezvous; the order must match the worker's (stdin first).
pub fn open_fifos(dir: &Path) -> ClientStdio {
    let stdin = OpenOptions::new()
        .write(true)
        .open(dir.join("stdin"))
        .expect("open stdin fifo");
    let stdout = File::open(dir.join("stdout")).expect("open stdout fifo");
    let stderr = File::open(dir.join("stderr")).expect("open stderr fifo");
    ClientStdio {
        stdin,
        stdout,
        stderr,
    }
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
