//! Persistent directory-backed FIFO queue.
//!
//! One file per item under the queue directory. Multiple unrelated
//! processes may put and get concurrently: a put writes a hidden temp
//! file and renames it into place, a get claims an item by renaming it
//! to a hidden name first — the rename succeeds for exactly one
//! claimant. Item names sort lexicographically in enqueue order per
//! producer, which gives FIFO delivery per sender.
//!
//! Items are opaque single-line strings; the envelope layer guarantees
//! tokens with no embedded newlines.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Per-process put counter, breaking ties when the clock is coarse.
static PUT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue directory does not exist.
    #[error("queue does not exist: {0}")]
    Missing(PathBuf),
    /// A bounded get elapsed without an item.
    #[error("timed out waiting for an item")]
    Timeout,
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A named, persistent, multi-process-safe FIFO of string items.
#[derive(Debug, Clone)]
pub struct DirQueue {
    dir: PathBuf,
}

impl DirQueue {
    /// Create the queue directory (idempotent) and return a handle.
    ///
    /// # Errors
    ///
    /// Propagates directory-creation failures.
    pub fn init(dir: &Path) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Open an existing queue.
    ///
    /// # Errors
    ///
    /// [`QueueError::Missing`] when the directory does not exist.
    pub fn open(dir: &Path) -> Result<Self, QueueError> {
        if !dir.is_dir() {
            return Err(QueueError::Missing(dir.to_path_buf()));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Remove the queue directory and everything in it.
    ///
    /// # Errors
    ///
    /// [`QueueError::Missing`] when there is nothing to destroy; other
    /// removal failures propagate.
    pub fn destroy(dir: &Path) -> Result<(), QueueError> {
        if !dir.is_dir() {
            return Err(QueueError::Missing(dir.to_path_buf()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// The queue's directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Append an item.
    ///
    /// # Errors
    ///
    /// [`QueueError::Missing`] when the queue has been destroyed; other
    /// I/O failures propagate.
    pub fn put(&self, item: &str) -> Result<(), QueueError> {
        if !self.dir.is_dir() {
            return Err(QueueError::Missing(self.dir.clone()));
        }
        let name = next_item_name();
        let tmp = self.dir.join(format!(".tmp.{name}"));
        fs::write(&tmp, item)?;
        fs::rename(&tmp, self.dir.join(&name))?;
        trace!(queue = %self.dir.display(), item = %name, "item enqueued");
        Ok(())
    }

    /// Remove and return the oldest item, waiting up to `timeout_secs`.
    ///
    /// Timeout semantics: negative waits indefinitely, zero polls once,
    /// positive bounds the wait in seconds.
    ///
    /// # Errors
    ///
    /// [`QueueError::Timeout`] when the bound elapses;
    /// [`QueueError::Missing`] when the queue disappears while waiting.
    pub fn get(&self, timeout_secs: i64) -> Result<String, QueueError> {
        let deadline = (timeout_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(timeout_secs.unsigned_abs()));
        loop {
            if !self.dir.is_dir() {
                return Err(QueueError::Missing(self.dir.clone()));
            }
            if let Some(item) = self.try_claim()? {
                return Ok(item);
            }
            if timeout_secs == 0 {
                return Err(QueueError::Timeout);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(QueueError::Timeout);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Visit current items in FIFO order without consuming them.
    ///
    /// The iteration is a snapshot: items claimed by a concurrent `get`
    /// are skipped, items enqueued after the snapshot are not visited.
    ///
    /// # Errors
    ///
    /// [`QueueError::Missing`] when the queue does not exist; read
    /// failures propagate.
    pub fn foreach<F>(&self, mut f: F) -> Result<(), QueueError>
    where
        F: FnMut(&str),
    {
        for name in self.item_names()? {
            match fs::read_to_string(self.dir.join(&name)) {
                Ok(contents) => f(&contents),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Try to claim the lexicographically first item. Losing a rename
    /// race to another consumer moves on to the next item.
    fn try_claim(&self) -> Result<Option<String>, QueueError> {
        for name in self.item_names()? {
            let item = self.dir.join(&name);
            let claim = self.dir.join(format!(".claim.{}.{name}", process::id()));
            match fs::rename(&item, &claim) {
                Ok(()) => {
                    let contents = fs::read_to_string(&claim)?;
                    fs::remove_file(&claim)?;
                    trace!(queue = %self.dir.display(), item = %name, "item claimed");
                    return Ok(Some(contents));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Pending item names in FIFO order. Hidden entries (temp files and
    /// in-flight claims) are excluded.
    fn item_names(&self) -> Result<Vec<String>, QueueError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(QueueError::Missing(self.dir.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_str()?.to_string();
                (!name.starts_with('.')).then_some(name)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

fn next_item_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = PUT_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    format!("{nanos:020}.{:08}.{seq:06}", process::id())
}
