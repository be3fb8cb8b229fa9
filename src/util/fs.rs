use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// Remove a directory tree if it still exists.
///
/// Returns `Ok(true)` when something was removed, `Ok(false)` when the path was already gone.
pub fn remove_dir_if_exists(p: &Path) -> io::Result<bool> {
    match std::fs::symlink_metadata(p) {
        Ok(_) => {
            std::fs::remove_dir_all(p)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Return true if `p` exists and is a named pipe.
pub fn is_fifo(p: &Path) -> bool {
    std::fs::symlink_metadata(p)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_dir_if_exists_is_idempotent() {
        let td = tempfile::tempdir().expect("tmpdir");
        let dir = td.path().join("child");
        std::fs::create_dir_all(dir.join("nested")).expect("mkdir");
        std::fs::write(dir.join("nested/file"), b"x").expect("write");

        assert!(remove_dir_if_exists(&dir).expect("first removal"));
        assert!(!dir.exists());
        assert!(!remove_dir_if_exists(&dir).expect("second removal"));
    }

    #[test]
    fn test_is_fifo_distinguishes_regular_files() {
        let td = tempfile::tempdir().expect("tmpdir");
        let fifo = td.path().join("pipe");
        let file = td.path().join("file");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).expect("mkfifo");
        std::fs::write(&file, b"").expect("write");

        assert!(is_fifo(&fifo));
        assert!(!is_fifo(&file));
        assert!(!is_fifo(&td.path().join("missing")));
    }
}
