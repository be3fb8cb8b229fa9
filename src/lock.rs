use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Socket-scoped instance lock that removes the lock file on drop.
///
/// Held for the lifetime of the service so a second instance cannot unlink a socket that
/// is still being served.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor a forked child must close so the lock dies with the service.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Best-effort unlock; ignore errors
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

/// Acquire a non-blocking exclusive lock at `p`.
pub fn acquire_lock_at(p: &Path) -> io::Result<InstanceLock> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = fs::create_dir_all(parent);
        }
    }
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(p)?;
    match f.try_lock_exclusive() {
        Ok(_) => {
            // Record the owner for operators inspecting the lock file.
            use std::io::Write as _;
            let _ = f.set_len(0);
            let mut owner = &f;
            let _ = writeln!(owner, "{}", std::process::id());
            Ok(InstanceLock {
                file: f,
                path: p.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "another forking service already holds {} (lock held)",
                p.display()
            ),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_first_is_dropped() {
        let td = tempfile::tempdir().expect("tmpdir");
        let p = td.path().join("svc.sock.lock");

        let first = acquire_lock_at(&p).expect("first lock");
        assert_eq!(first.path(), p.as_path());

        let err = acquire_lock_at(&p).expect_err("second lock must fail");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(err.to_string().contains("lock held"), "{err}");

        drop(first);
        assert!(!p.exists(), "lock file should be removed on drop");
        let again = acquire_lock_at(&p).expect("lock after release");
        drop(again);
    }
}
