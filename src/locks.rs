//! Named locks with bounded waits.
//!
//! Keys are `ws:<id>` (single writer per workspace) and `target:<branch>`
//! (merges into one branch are serialized). Callers that need several keys
//! take the target key first and then workspace keys in sorted order.
//!
//! Within a process a key is a condvar-guarded entry in a set. With a lock
//! directory each key is also an exclusive `flock` on `<dir>/<key>.lock`,
//! which extends the exclusion to every process sharing the directory, such
//! as separate `tandem` invocations against one registry. The OS drops the
//! file lock when its holder exits, so a crash never leaves a stale lock.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use thiserror::Error;

/// How often a contended lock file is retried.
const FILE_LOCK_POLL: Duration = Duration::from_millis(10);

/// A set of currently held keys plus a condvar to wait on releases.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    dir: Option<PathBuf>,
}

/// Returned when a key could not be acquired.
#[derive(Debug, Error)]
pub enum LockError {
    /// The key was still held when the wait expired.
    #[error("lock '{key}' still held after {waited:?}")]
    Timeout { key: String, waited: Duration },

    /// The lock file could not be opened or locked.
    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KeyedLocks {
    /// Locks that only exclude threads of this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using `dir`.
    ///
    /// # Errors
    /// Returns an error if `dir` cannot be created.
    pub fn in_dir(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: Some(dir.to_owned()),
            ..Self::default()
        })
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire `key`, waiting at most `timeout` (`None` waits forever).
    ///
    /// # Errors
    /// [`LockError::Timeout`] if the key is still held when the wait
    /// expires, or [`LockError::Io`] if its lock file cannot be used.
    pub fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<KeyGuard<'_>, LockError> {
        let started = Instant::now();
        let mut held = self.held();
        while held.contains(key) {
            held = match timeout {
                None => self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(limit) => {
                    let waited = started.elapsed();
                    if waited >= limit {
                        return Err(LockError::Timeout {
                            key: key.to_owned(),
                            waited,
                        });
                    }
                    self.released
                        .wait_timeout(held, limit - waited)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        held.insert(key.to_owned());
        drop(held);

        let file = self
            .dir
            .as_deref()
            .map(|dir| lock_file(dir, key, started, timeout))
            .transpose();
        match file {
            Ok(file) => Ok(KeyGuard {
                locks: self,
                key: key.to_owned(),
                _file: file,
            }),
            Err(e) => {
                self.release(key);
                Err(e)
            }
        }
    }

    fn release(&self, key: &str) {
        self.held().remove(key);
        self.released.notify_all();
    }

    /// Acquire `key`, waiting as long as it takes.
    ///
    /// # Errors
    /// [`LockError::Io`] if the key's lock file cannot be used.
    pub fn lock(&self, key: &str) -> Result<KeyGuard<'_>, LockError> {
        self.acquire(key, None)
    }

    /// Acquire several keys in the given order. Already-acquired keys are
    /// released if a later one fails.
    ///
    /// # Errors
    /// The [`LockError`] of the first key that could not be acquired.
    pub fn acquire_all(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
    ) -> Result<Vec<KeyGuard<'_>>, LockError> {
        let started = Instant::now();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
            guards.push(self.acquire(key, remaining)?);
        }
        Ok(guards)
    }

    /// Returns `true` if `key` is currently held by this process.
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.held().contains(key)
    }
}

/// Open `<dir>/<key>.lock` and take an exclusive lock on it, polling until
/// `timeout` (measured from `started`) runs out.
fn lock_file(
    dir: &Path,
    key: &str,
    started: Instant,
    timeout: Option<Duration>,
) -> Result<File, LockError> {
    let path = dir.join(lock_file_name(key));
    let io_err = |source| LockError::Io {
        path: path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(io_err)?;

    let Some(limit) = timeout else {
        file.lock_exclusive().map_err(io_err)?;
        return Ok(file);
    };
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(LockError::Timeout {
                        key: key.to_owned(),
                        waited,
                    });
                }
                thread::sleep(FILE_LOCK_POLL.min(limit - waited));
            }
            Err(e) => return Err(io_err(e)),
        }
    }
}

/// `ws:ws-1` → `ws%3Aws-1.lock`. Bytes outside `[A-Za-z0-9._-]` are
/// percent-encoded so distinct keys never share a file.
fn lock_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            name.push(char::from(b));
        } else {
            name.push_str(&format!("%{b:02X}"));
        }
    }
    name.push_str(".lock");
    name
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    /// Closing the file releases the cross-process lock.
    _file: Option<File>,
}

impl KeyGuard<'_> {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Lock key for a workspace.
#[must_use]
pub fn workspace_key(id: &str) -> String {
    format!("ws:{id}")
}

/// Lock key for a merge target branch.
#[must_use]
pub fn target_key(branch: &str) -> String {
    format!("target:{branch}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let locks = KeyedLocks::new();
        {
            let guard = locks.lock("ws:a").unwrap();
            assert_eq!(guard.key(), "ws:a");
            assert!(locks.is_held("ws:a"));
        }
        assert!(!locks.is_held("ws:a"));
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("ws:a", None).unwrap();
        let _b = locks.acquire("ws:b", Some(Duration::ZERO)).unwrap();
    }

    #[test]
    fn held_key_times_out() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("target:main", None).unwrap();
        let err = locks
            .acquire("target:main", Some(Duration::from_millis(20)))
            .unwrap_err();
        match err {
            LockError::Timeout { key, waited } => {
                assert_eq!(key, "target:main");
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("expected a timeout, got {other}"),
        }
    }

    #[test]
    fn acquire_all_rolls_back_on_timeout() {
        let locks = KeyedLocks::new();
        let _b = locks.acquire("ws:b", None).unwrap();
        let keys = vec!["ws:a".to_owned(), "ws:b".to_owned()];
        assert!(locks.acquire_all(&keys, Some(Duration::from_millis(10))).is_err());
        assert!(!locks.is_held("ws:a"));
    }

    #[test]
    fn same_key_is_mutually_exclusive_across_threads() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    let _g = locks.acquire("target:main", None).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_files_exclude_other_holders_of_the_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = KeyedLocks::in_dir(dir.path()).unwrap();
        let second = KeyedLocks::in_dir(dir.path()).unwrap();

        let held = first.acquire("ws:a", None).unwrap();
        assert!(dir.path().join("ws%3Aa.lock").exists());
        assert!(!second.is_held("ws:a"));
        let err = second
            .acquire("ws:a", Some(Duration::from_millis(30)))
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }), "{err}");
        // A failed file lock gives the in-process key back.
        assert!(!second.is_held("ws:a"));
        let _other = second.acquire("ws:b", Some(Duration::ZERO)).unwrap();

        drop(held);
        let _now = second.acquire("ws:a", Some(Duration::from_millis(200))).unwrap();
    }

    #[test]
    fn lock_file_waits_for_release_in_another_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = Arc::new(KeyedLocks::in_dir(dir.path()).unwrap());
        let second = KeyedLocks::in_dir(dir.path()).unwrap();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let holder = {
            let first = Arc::clone(&first);
            thread::spawn(move || {
                let _g = first.acquire("target:main", None).unwrap();
                ready_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
        };
        ready_rx.recv().unwrap();
        let started = Instant::now();
        let _g = second.lock("target:main").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        holder.join().unwrap();
    }

    #[test]
    fn lock_file_names_are_escaped() {
        assert_eq!(lock_file_name("ws:ws-1"), "ws%3Aws-1.lock");
        assert_eq!(
            lock_file_name("target:tandem/ws/x"),
            "target%3Atandem%2Fws%2Fx.lock"
        );
        assert_ne!(lock_file_name("target:a/b"), lock_file_name("target:a-b"));
    }

    #[test]
    fn key_helpers() {
        assert_eq!(workspace_key("ws-1"), "ws:ws-1");
        assert_eq!(target_key("main"), "target:main");
    }
}
