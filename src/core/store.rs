//! Lock-guarded JSON documents shared between gslurm processes.
//!
//! Every document `<path>` has a marker file `<path>.lock`. A process holds an
//! exclusive `flock` on the marker for the duration of one read, one write or
//! one read-modify-write. The kernel drops the lock when the holder exits, so a
//! crashed process never leaves a document locked.
//!
//! Writes go to a uniquely named temporary file next to the target and are
//! renamed over it.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
}

/// How long to back off between lock attempts, and for how long to keep trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever
    pub max_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_wait: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// Path of the lock marker guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut marker = OsString::from(path.as_os_str());
    marker.push(".lock");
    PathBuf::from(marker)
}

/// Exclusive hold on one document. Released on drop.
#[derive(Debug)]
pub struct DocumentLock {
    file: File,
    path: PathBuf,
}

impl DocumentLock {
    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Reads and writes JSON documents under the lock protocol.
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    policy: RetryPolicy,
}

impl DocumentStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Acquire the lock guarding `path`, retrying while another process holds it.
    pub fn lock(&self, path: &Path) -> Result<DocumentLock> {
        let marker = lock_path(path);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&marker)
            .with_context(|| format!("Failed to open lock file {}", marker.display()))?;

        let started = Instant::now();
        loop {
            if file
                .try_lock_exclusive()
                .with_context(|| format!("Failed to lock {}", marker.display()))?
            {
                tracing::trace!("Acquired lock {}", marker.display());
                return Ok(DocumentLock { file, path: marker });
            }

            let waited = started.elapsed();
            let mut pause = self.policy.interval;
            if let Some(max_wait) = self.policy.max_wait {
                if waited >= max_wait {
                    return Err(StoreError::LockTimeout {
                        path: path.to_path_buf(),
                        waited,
                    }
                    .into());
                }
                pause = pause.min(max_wait - waited);
            }

            tracing::debug!(
                "{} is locked by another process, retrying in {:?}",
                path.display(),
                pause
            );
            thread::sleep(pause);
        }
    }

    /// Read and decode a document. A missing document is an error.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let _lock = self.lock(path)?;
        read_unlocked(path)
    }

    /// Read a document, returning `None` when it does not exist.
    pub fn read_optional<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let _lock = self.lock(path)?;
        if !path.exists() {
            return Ok(None);
        }
        read_unlocked(path).map(Some)
    }

    /// Replace a document with `value`.
    pub fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let _lock = self.lock(path)?;
        write_unlocked(path, value)
    }

    /// Read-modify-write under a single lock hold.
    ///
    /// A missing document starts from `T::default()`. Nothing is written when
    /// `f` fails.
    pub fn update<T, R, F>(&self, path: &Path, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let _lock = self.lock(path)?;
        let mut value = if path.exists() {
            read_unlocked(path)?
        } else {
            T::default()
        };
        let result = f(&mut value)?;
        write_unlocked(path, &value)?;
        Ok(result)
    }

    /// Delete a document if it exists.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let _lock = self.lock(path)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

fn read_unlocked<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to decode {}", path.display()))
}

fn write_unlocked<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to encode {}", path.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(&json)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to move {} into place", path.display()))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Where documents live under the state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inventory_path(&self, partition: &str) -> PathBuf {
        self.root.join("resources").join(format!("{partition}.json"))
    }

    /// Partitions that have an inventory document, sorted.
    pub fn inventory_partitions(&self) -> Result<Vec<String>> {
        let dir = self.root.join("resources");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", dir.display()))
            }
        };

        let mut partitions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        partitions.sort();
        Ok(partitions)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn assignments_path(&self, partition: &str) -> PathBuf {
        self.root
            .join("assignments")
            .join(format!("{partition}.json"))
    }

    pub fn submitted_path(&self, partition: &str, timestamp: &str) -> PathBuf {
        self.root
            .join("submitted")
            .join(format!("{timestamp}_{partition}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn fast_store() -> DocumentStore {
        DocumentStore::new(RetryPolicy::new(Duration::from_millis(5)))
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        let store = fast_store();

        let doc = BTreeMap::from([("h1".to_string(), 2u32)]);
        store.write(&path, &doc).unwrap();

        let back: BTreeMap<String, u32> = store.read(&path).unwrap();
        assert_eq!(back, doc);
        assert!(lock_path(&path).exists());

        // No temporary files are left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_missing_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let store = fast_store();

        assert!(store.read::<Vec<u32>>(&path).is_err());
        assert_eq!(store.read_optional::<Vec<u32>>(&path).unwrap(), None);
    }

    #[test]
    fn test_read_reports_malformed_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();

        let err = fast_store().read::<Vec<u32>>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.json"));
    }

    #[test]
    fn test_update_starts_from_default_and_keeps_result() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = fast_store();

        let len = store
            .update(&path, |queue: &mut Vec<u32>| {
                queue.extend([1, 2, 3]);
                Ok(queue.len())
            })
            .unwrap();
        assert_eq!(len, 3);

        let taken = store
            .update(&path, |queue: &mut Vec<u32>| Ok(std::mem::take(queue)))
            .unwrap();
        assert_eq!(taken, vec![1, 2, 3]);
        assert!(store.read::<Vec<u32>>(&path).unwrap().is_empty());
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = fast_store();
        store.write(&path, &vec![1u32]).unwrap();

        let result = store.update(&path, |queue: &mut Vec<u32>| -> Result<()> {
            queue.clear();
            anyhow::bail!("nope")
        });
        assert!(result.is_err());
        assert_eq!(store.read::<Vec<u32>>(&path).unwrap(), vec![1]);
    }

    #[test]
    fn test_held_lock_times_out_bounded_waiter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store = fast_store();
        let bounded = DocumentStore::new(
            RetryPolicy::new(Duration::from_millis(5)).with_max_wait(Duration::from_millis(50)),
        );

        let held = store.lock(&path).unwrap();
        let err = bounded.lock(&path).unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::LockTimeout { path: p, .. }) => assert_eq!(p, &path),
            None => panic!("expected lock timeout, got {err:#}"),
        }

        drop(held);
        assert!(bounded.lock(&path).is_ok());
    }

    #[test]
    fn test_release_lets_waiter_proceed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store = fast_store();

        let held = store.lock(&path).unwrap();
        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let store = fast_store();
            store.write(&waiter_path, &vec![7u32]).unwrap();
            tx.send(()).unwrap();
        });

        // The waiter cannot finish while the lock is held
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();

        assert_eq!(store.read::<Vec<u32>>(&path).unwrap(), vec![7]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let store = fast_store();
        store.write(&path, &1u32).unwrap();

        store.remove(&path).unwrap();
        store.remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_state_layout_paths() {
        let layout = StateLayout::new("/state");
        assert_eq!(
            layout.inventory_path("p1"),
            PathBuf::from("/state/resources/p1.json")
        );
        assert_eq!(layout.queue_path(), PathBuf::from("/state/queue.json"));
        assert_eq!(
            layout.assignments_path("p1"),
            PathBuf::from("/state/assignments/p1.json")
        );
        assert_eq!(
            layout.submitted_path("p1", "20240101-120000"),
            PathBuf::from("/state/submitted/20240101-120000_p1.json")
        );
        assert_eq!(
            lock_path(&layout.queue_path()),
            PathBuf::from("/state/queue.json.lock")
        );
    }

    #[test]
    fn test_inventory_partitions_ignores_lock_files() {
        let dir = tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        assert!(layout.inventory_partitions().unwrap().is_empty());

        let store = fast_store();
        store.write(&layout.inventory_path("p2"), &1u32).unwrap();
        store.write(&layout.inventory_path("p1"), &1u32).unwrap();

        assert_eq!(layout.inventory_partitions().unwrap(), vec!["p1", "p2"]);
    }
}
