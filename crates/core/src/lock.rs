//! Cooperative cross-process lock files.
//!
//! A lock is an ordinary file created with create-exclusive semantics next to
//! the protected path (`<path>.lock`). Its existence is the mutex; the
//! `pid=.. thread=.. ts=..` line written into it is only for whoever has to
//! debug a stuck lock.
//!
//! This is deliberately a polling design and doesn't use OS advisory locks,
//! so it behaves the same on every platform and on network-mounted
//! filesystems.
//!
//! # Guarantees
//!
//! - Acquisition is bounded by a timeout; it never hangs indefinitely
//! - The lock file is removed on every exit path: explicit [`LockGuard::release`]
//!   or drop (including unwinding and early `?` returns)

use crate::error::{CacheError, Result};
use crate::snapshot::now_ms;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Floor for the poll interval so a zero interval doesn't spin.
const MIN_POLL: Duration = Duration::from_millis(1);

/// A held lock file. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    /// Path of the lock artifact.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the diagnostic content of the lock file.
    pub fn write_note(&mut self, note: &str) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(note.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    /// Close and delete the lock file, reporting failures.
    ///
    /// Drop does the same thing but can only log.
    pub fn release(mut self) -> Result<()> {
        self.release_inner().map_err(Into::into)
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        drop(file);

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// Path of the per-write lock for `target`: `<target>.lock`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    sibling_with_suffix(target, ".lock")
}

/// Append `suffix` to the file name of `target`.
pub(crate) fn sibling_with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    target.with_file_name(name)
}

/// Acquire an exclusive lock file, polling until `timeout` elapses.
///
/// # Errors
/// - `CacheError::LockTimeout` naming the contended path if the lock file
///   still exists when the deadline passes
/// - `Error::Io` for failures other than contention (e.g., missing directory)
pub fn acquire_lock(path: &Path, timeout: Duration, poll_interval: Duration) -> Result<LockGuard> {
    let started = Instant::now();
    let deadline = started + timeout;
    let poll = poll_interval.max(MIN_POLL);
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let note = diagnostic_note();
                // Content is informational; a failed write doesn't void the lock.
                if let Err(e) = file.write_all(note.as_bytes()) {
                    debug!(path = %path.display(), error = %e, "could not write lock diagnostics");
                }
                if attempts > 1 {
                    debug!(
                        path = %path.display(),
                        attempts,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "acquired contended lock"
                    );
                }
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    file: Some(file),
                });
            }
            Err(e) if is_contention(&e) => {
                if Instant::now() >= deadline {
                    return Err(CacheError::LockTimeout {
                        path: path.to_path_buf(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    }
                    .into());
                }
                std::thread::sleep(poll);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Run `op` while holding the lock for `target`, releasing it on every path.
pub fn with_lock<T>(
    target: &Path,
    timeout: Duration,
    poll_interval: Duration,
    op: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire_lock(&lock_path_for(target), timeout, poll_interval)?;
    let result = op();
    match guard.release() {
        Ok(()) => result,
        Err(release_err) => {
            warn!(target = %target.display(), error = %release_err, "lock release failed");
            result
        }
    }
}

/// An existing lock file shows up as `AlreadyExists`; on Windows a lock file
/// that is mid-deletion reports `PermissionDenied` instead.
fn is_contention(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::AlreadyExists => true,
        io::ErrorKind::PermissionDenied => cfg!(windows),
        _ => false,
    }
}

fn diagnostic_note() -> String {
    format!(
        "pid={} thread={:?} ts={}\n",
        std::process::id(),
        std::thread::current().id(),
        now_ms()
    )
}
