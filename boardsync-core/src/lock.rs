//! Named, timeout-bound lock files.
//!
//! A lock is a sibling file created with `O_CREAT | O_EXCL`. The holder writes
//! its pid and acquisition time into it and removes it on drop. A lock whose
//! mtime is older than `stale_after` is assumed abandoned by a crashed process
//! and is reclaimed.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;

use crate::error::{io_err, StoreError};

/// Timing knobs for [`FileLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up with [`StoreError::LockTimeout`] after waiting this long.
    pub timeout: Duration,
    /// Locks older than this are reclaimed.
    pub stale_after: Duration,
    /// Delay between attempts while the lock is held elsewhere.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// RAII guard for a held lock file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// `<target>.lock`
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the lock guarding `target`, blocking up to `opts.timeout`.
    pub fn acquire(target: &Path, opts: LockOptions) -> Result<Self, StoreError> {
        let path = Self::path_for(target);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = format!("{}\n{}\n", std::process::id(), Utc::now().to_rfc3339());
                    if let Err(err) = file.write_all(stamp.as_bytes()) {
                        drop(file);
                        // A lock file we created but could not stamp must not outlive us.
                        let _ = std::fs::remove_file(&path);
                        return Err(io_err(&path, err));
                    }
                    tracing::debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, opts.stale_after) {
                        tracing::warn!(lock = %path.display(), "reclaiming stale lock");
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(io_err(&path, e)),
                        }
                    }
                    let waited = started.elapsed();
                    if waited >= opts.timeout {
                        return Err(StoreError::LockTimeout { path, waited });
                    }
                    std::thread::sleep(opts.poll_interval);
                }
                Err(err) => return Err(io_err(&path, err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(lock = %self.path.display(), error = %err, "failed to release lock");
            }
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        // Vanished between the failed create and now; retry immediately.
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(150),
            stale_after: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn lock_file_sits_next_to_target() {
        let path = FileLock::path_for(Path::new("/tmp/x/mappings.json"));
        assert_eq!(path, PathBuf::from("/tmp/x/mappings.json.lock"));
    }

    #[test]
    fn drop_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        {
            let guard = FileLock::acquire(&target, quick()).unwrap();
            assert!(guard.path().exists());
        }
        assert!(!FileLock::path_for(&target).exists());
        FileLock::acquire(&target, quick()).expect("re-acquire after release");
    }

    #[test]
    fn held_lock_times_out() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let _held = FileLock::acquire(&target, quick()).unwrap();
        let err = FileLock::acquire(&target, quick()).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }), "got: {err}");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let lock_path = FileLock::path_for(&target);
        std::fs::write(&lock_path, "99999\n").unwrap();
        let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(600));
        set_file_mtime(&lock_path, old).unwrap();

        let guard = FileLock::acquire(&target, quick()).expect("stale lock reclaimed");
        let contents = std::fs::read_to_string(guard.path()).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
    }
}
