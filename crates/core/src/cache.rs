//! Cache synchronization: atomic replace, append-only logs, writer claims.
//!
//! Independent processes share one snapshot file. Every write goes through
//! the same discipline:
//!
//! 1. take `<path>.lock` (see [`crate::lock`])
//! 2. write the content to a uniquely named sibling temp file
//! 3. flush and `sync_all` the temp file
//! 4. rename it onto `path`
//!
//! so `path` always holds either the previous or the new complete content.
//! Writes that fail transiently (typically a third-party process holding the
//! file open) are retried with exponential backoff plus jitter.
//!
//! The writer claim (`<path>.writer.lock`) is a separate, advisory marker
//! naming which role owns the cache. Failing to claim never blocks writes.

use crate::error::{CacheError, Error, Result};
use crate::lock::{acquire_lock, sibling_with_suffix, with_lock, LockGuard};
use crate::snapshot::{Snapshot, Source};
use rand::Rng;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing knobs for lock acquisition and write retries.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// How long to wait for `<path>.lock`
    pub lock_timeout: Duration,

    /// Sleep between lock attempts
    pub poll_interval: Duration,

    /// Total write attempts before giving up
    pub write_retries: u32,

    /// First backoff delay; doubles each attempt
    pub base_backoff: Duration,

    /// Backoff ceiling (before jitter)
    pub max_backoff: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            write_retries: 20,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(800),
        }
    }
}

impl CacheOptions {
    /// Fast settings for tests and tight loops.
    pub fn quick() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(2),
            write_retries: 5,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        }
    }

    /// Backoff before retry number `attempt` (1-based), including jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << exp).min(self.max_backoff);
        let jitter_cap = self.base_backoff.as_micros().max(1) as u64;
        delay + Duration::from_micros(rand::thread_rng().gen_range(0..jitter_cap))
    }
}

/// Replace `path` with `content` atomically, under the lock.
///
/// # Errors
/// - `CacheError::LockTimeout` if the lock can't be taken
/// - `CacheError::WriteExhausted` if every attempt failed transiently; the
///   previous content of `path` is untouched
/// - `Error::Io` for non-transient failures (also leaves `path` untouched)
pub fn atomic_write(path: &Path, content: &[u8], opts: &CacheOptions) -> Result<()> {
    ensure_parent(path)?;
    with_lock(path, opts.lock_timeout, opts.poll_interval, || {
        retry_transient(path, opts, |_| write_and_rename(path, content))
    })
}

/// Serialize `value` as pretty JSON and [`atomic_write`] it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T, opts: &CacheOptions) -> Result<()> {
    let text = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &text, opts)
}

/// Append one line to `path` under the lock and force it to stable storage.
///
/// A trailing newline is added if `line` lacks one. Prior lines are never
/// rewritten.
pub fn atomic_append(path: &Path, line: &str, opts: &CacheOptions) -> Result<()> {
    ensure_parent(path)?;
    with_lock(path, opts.lock_timeout, opts.poll_interval, || {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })
}

/// Serialize `value` as a single JSON line and [`atomic_append`] it.
pub fn atomic_append_json<T: Serialize>(path: &Path, value: &T, opts: &CacheOptions) -> Result<()> {
    let line = serde_json::to_string(value)?;
    atomic_append(path, &line, opts)
}

/// Persist a snapshot as the shared cache record.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot, opts: &CacheOptions) -> Result<()> {
    atomic_write(path, &snapshot.to_cache_json()?, opts)
}

/// Read and parse the cache record, retrying transient read/parse failures.
///
/// Readers take no lock: the writer only ever renames complete files into
/// place. Hard format errors (`CacheError::MalformedRecord`) are not retried.
pub fn read_snapshot(path: &Path, retries: u32, retry_delay: Duration) -> Result<Snapshot> {
    let attempts = retries.max(1);
    let mut attempt = 1;
    loop {
        let outcome = std::fs::read(path)
            .map_err(Error::from)
            .and_then(|bytes| Snapshot::from_cache_json(&bytes));

        match outcome {
            Ok(snapshot) => return Ok(snapshot),
            Err(e @ Error::Cache(CacheError::MalformedRecord { .. })) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "cache read failed; retrying");
                std::thread::sleep(retry_delay);
                attempt += 1;
            }
        }
    }
}

/// Advisory marker that one role currently owns a cache path.
///
/// Released on drop, which covers clean process exit from `main`.
#[derive(Debug)]
pub struct WriterClaim {
    role: Source,
    guard: LockGuard,
}

impl WriterClaim {
    pub fn role(&self) -> Source {
        self.role
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    pub fn release(self) -> Result<()> {
        self.guard.release()
    }
}

/// Path of the writer claim for `target`: `<target>.writer.lock`.
pub fn writer_claim_path(target: &Path) -> PathBuf {
    sibling_with_suffix(target, ".writer.lock")
}

/// Try to claim single-writer ownership of `path` for `role`.
///
/// Best effort: on timeout (another role holds the claim) this logs a
/// warning and returns `None`, and the caller should carry on writing.
pub fn claim_single_writer(path: &Path, role: Source, timeout: Duration) -> Option<WriterClaim> {
    let claim_path = writer_claim_path(path);
    if let Err(e) = ensure_parent(path) {
        warn!(path = %path.display(), error = %e, "cannot prepare writer claim directory");
        return None;
    }

    match acquire_lock(&claim_path, timeout, Duration::from_millis(50)) {
        Ok(mut guard) => {
            let note = format!("writer={} pid={}\n", role, std::process::id());
            if let Err(e) = guard.write_note(&note) {
                debug!(path = %claim_path.display(), error = %e, "could not record writer role");
            }
            info!(path = %claim_path.display(), role = %role, "claimed cache writer");
            Some(WriterClaim { role, guard })
        }
        Err(e) => {
            let holder = std::fs::read_to_string(&claim_path).unwrap_or_default();
            warn!(
                path = %claim_path.display(),
                role = %role,
                holder = holder.trim(),
                error = %e,
                "writer claim failed; continuing without exclusive claim"
            );
            None
        }
    }
}

/// Persistent sequence counter stored as decimal text in a sibling file.
#[derive(Debug, Clone)]
pub struct SequenceStore {
    path: PathBuf,
}

impl SequenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default state file for a cache path: `<cache>.packet_id`.
    pub fn beside(cache_path: &Path) -> Self {
        Self::new(sibling_with_suffix(cache_path, ".packet_id"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted value; 0 if the file is missing or unreadable.
    pub fn load(&self) -> i64 {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => 0,
            Ok(text) => text.trim().parse().unwrap_or_else(|_| {
                warn!(path = %self.path.display(), "unparseable sequence state; reset to 0");
                0
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to load sequence state; reset to 0");
                0
            }
        }
    }

    pub fn save(&self, value: i64, opts: &CacheOptions) -> Result<()> {
        atomic_write(&self.path, value.to_string().as_bytes(), opts)
    }
}

/// Human-actionable guess at who is holding `path`.
pub fn contention_hint(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!(
        "hint: the file may be held by antivirus, a search indexer, a file previewer or \
         another writer process; close JSON viewers and make sure only one writer targets {name}"
    )
}

/// Run `attempt_fn` up to `opts.write_retries` times while it fails transiently.
fn retry_transient<F>(path: &Path, opts: &CacheOptions, mut attempt_fn: F) -> Result<()>
where
    F: FnMut(u32) -> io::Result<()>,
{
    let attempts = opts.write_retries.max(1);
    let mut attempt = 1;
    loop {
        match attempt_fn(attempt) {
            Ok(()) => return Ok(()),
            Err(e) if !is_transient(&e) => return Err(e.into()),
            Err(e) if attempt >= attempts => {
                warn!(path = %path.display(), attempts, error = %e, "atomic replace failed after retries");
                return Err(CacheError::WriteExhausted {
                    path: path.to_path_buf(),
                    attempts,
                    hint: contention_hint(path),
                    source: e,
                }
                .into());
            }
            Err(e) => {
                let delay = opts.backoff(attempt);
                warn!(
                    path = %path.display(),
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient write failure; retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// One write attempt: temp sibling, fsync, rename. Cleans up the temp file on failure.
fn write_and_rename(path: &Path, content: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let token: u32 = rand::thread_rng().gen();
    sibling_with_suffix(path, &format!(".tmp.{}.{:08x}", std::process::id(), token))
}

/// "File in use"-style failures worth retrying.
fn is_transient(e: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION on Windows
    const WINDOWS_IN_USE: [i32; 2] = [32, 33];

    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    ) || (cfg!(windows) && e.raw_os_error().is_some_and(|c| WINDOWS_IN_USE.contains(&c)))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_path_for;
    use crate::snapshot::{BedRecord, VitalValue};

    fn in_use() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "file in use")
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        atomic_write(&path, b"first", &CacheOptions::quick()).unwrap();
        atomic_write(&path, b"second", &CacheOptions::quick()).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!lock_path_for(&path).exists());

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_retry_succeeds_after_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let mut calls = 0;

        let result = retry_transient(&path, &CacheOptions::quick(), |_| {
            calls += 1;
            if calls < 3 {
                Err(in_use())
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhaustion_carries_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let opts = CacheOptions::quick();
        let mut calls = 0;

        let result = retry_transient(&path, &opts, |_| {
            calls += 1;
            Err(in_use())
        });

        assert_eq!(calls, opts.write_retries);
        match result {
            Err(Error::Cache(CacheError::WriteExhausted { attempts, hint, .. })) => {
                assert_eq!(attempts, opts.write_retries);
                assert!(hint.contains("c.json"));
                assert!(hint.contains("antivirus"));
            }
            other => panic!("expected WriteExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_non_transient_error_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        let mut calls = 0;

        let result = retry_transient(&path, &CacheOptions::quick(), |_| {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad"))
        });

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let opts = CacheOptions::quick();
        for attempt in 1..40 {
            let delay = opts.backoff(attempt);
            assert!(delay >= opts.base_backoff.min(opts.max_backoff));
            assert!(delay <= opts.max_backoff + opts.base_backoff);
        }
    }

    #[test]
    fn test_write_times_out_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"old").unwrap();
        let _held = acquire_lock(&lock_path_for(&path), Duration::from_millis(50), Duration::from_millis(1)).unwrap();

        let opts = CacheOptions {
            lock_timeout: Duration::from_millis(50),
            ..CacheOptions::quick()
        };
        let result = atomic_write(&path, b"new", &opts);

        assert!(matches!(result, Err(ref e) if e.is_transient()));
        assert_eq!(std::fs::read(&path).unwrap(), b"old");
    }

    #[test]
    fn test_atomic_append_adds_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truth.jsonl");
        let opts = CacheOptions::quick();

        atomic_append(&path, "{\"a\":1}", &opts).unwrap();
        atomic_append(&path, "{\"a\":2}\n", &opts).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_snapshot_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut snap = Snapshot::new(1234, 5, Source::Generator);
        let mut bed = BedRecord::new();
        bed.insert("HR", VitalValue::new(61.0));
        snap.insert_bed("BED01", bed);

        write_snapshot(&path, &snap, &CacheOptions::quick()).unwrap();
        let read = read_snapshot(&path, 3, Duration::from_millis(1)).unwrap();
        assert_eq!(read, snap);
    }

    #[test]
    fn test_read_snapshot_gives_up_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_snapshot(&dir.path().join("none.json"), 2, Duration::from_millis(1));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_writer_claim_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let claim = claim_single_writer(&path, Source::Receiver, Duration::from_millis(50)).unwrap();
        assert_eq!(claim.role(), Source::Receiver);
        let note = std::fs::read_to_string(writer_claim_path(&path)).unwrap();
        assert!(note.starts_with("writer=receiver"));

        // A second claimant times out but may still write
        assert!(claim_single_writer(&path, Source::Generator, Duration::from_millis(30)).is_none());
        atomic_write(&path, b"{}", &CacheOptions::quick()).unwrap();

        claim.release().unwrap();
        assert!(!writer_claim_path(&path).exists());
    }

    #[test]
    fn test_sequence_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SequenceStore::beside(&dir.path().join("cache.json"));
        assert_eq!(store.load(), 0);

        store.save(41, &CacheOptions::quick()).unwrap();
        assert_eq!(store.load(), 41);

        std::fs::write(store.path(), "garbage").unwrap();
        assert_eq!(store.load(), 0);
    }
}
