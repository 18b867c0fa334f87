//! Local transfer cache
//!
//! Remembers, per (local path, remote object) pair, the digest, size and
//! modification time observed after the last successful transfer. The index
//! is a single JSON file that is only ever replaced whole (write temp, then
//! rename), so a reader in another process sees either the old or the new
//! index, never a torn one. An unreadable or corrupt index is treated as an
//! empty cache.

use crate::error::{IoResultExt, Result, TransferError};
use crate::hash::Digest;
use crate::transport::RemoteId;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Modification time with nanosecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// Seconds since the Unix epoch
    pub secs: i64,
    /// Sub-second nanoseconds
    pub nanos: u32,
}

impl FileStamp {
    /// Read the modification time from metadata
    pub fn of(metadata: &Metadata) -> Self {
        let mtime = FileTime::from_last_modification_time(metadata);
        Self {
            secs: mtime.unix_seconds(),
            nanos: mtime.nanoseconds(),
        }
    }

    /// Read the modification time of a path
    pub fn of_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).with_path(path)?;
        Ok(Self::of(&metadata))
    }
}

/// A single cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Absolute local path
    pub local_path: PathBuf,
    /// Remote object identity
    pub remote: RemoteId,
    /// Digest of the verified content
    pub digest: Digest,
    /// Size in bytes
    pub size: u64,
    /// Local modification time when recorded
    pub mtime: FileStamp,
    /// When the digest was last verified against real bytes
    pub last_verified: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether size and modification time still match the local file
    pub fn matches_metadata(&self, size: u64, mtime: FileStamp) -> bool {
        self.size == size && self.mtime == mtime
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    entries: Vec<CacheEntry>,
}

type CacheKey = (PathBuf, RemoteId);

/// Process-wide transfer cache service
///
/// Construct once, share through `Arc`, and call [`TransferCache::flush`] on
/// shutdown. Reads take a shared lock; writers are serialized.
#[derive(Debug)]
pub struct TransferCache {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Serializes writers; holds the "unsaved changes" flag
    writer: Mutex<bool>,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl TransferCache {
    /// Current index version
    pub const VERSION: u32 = 1;

    /// Open the cache at `path`, degrading to empty on any read problem
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::load(&path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Transfer cache at {} unusable, starting empty: {}", path.display(), e);
                HashMap::new()
            }
        };
        tracing::debug!("Loaded {} cache entries from {}", entries.len(), path.display());

        Self {
            path: Some(path),
            entries: RwLock::new(entries),
            writer: Mutex::new(false),
        }
    }

    /// A cache that is never persisted
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(false),
        }
    }

    fn load(path: &Path) -> Result<HashMap<CacheKey, CacheEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let json = std::fs::read_to_string(path).with_path(path)?;
        let index: CacheIndex =
            serde_json::from_str(&json).map_err(|e| TransferError::Cache(e.to_string()))?;
        if index.version != Self::VERSION {
            return Err(TransferError::Cache(format!(
                "unsupported index version {}",
                index.version
            )));
        }

        Ok(index
            .entries
            .into_iter()
            .map(|entry| ((entry.local_path.clone(), entry.remote.clone()), entry))
            .collect())
    }

    /// Look up the entry for a (local path, remote) pair
    pub fn lookup(&self, local_path: &Path, remote: &RemoteId) -> Option<CacheEntry> {
        let key = (normalize(local_path), remote.clone());
        read_lock(&self.entries).get(&key).cloned()
    }

    /// Record a verified transfer, replacing any previous entry for the pair
    pub fn record(
        &self,
        local_path: &Path,
        remote: &RemoteId,
        digest: Digest,
        size: u64,
        mtime: FileStamp,
    ) -> Result<()> {
        let local_path = normalize(local_path);
        let entry = CacheEntry {
            local_path: local_path.clone(),
            remote: remote.clone(),
            digest,
            size,
            mtime,
            last_verified: Utc::now(),
        };

        self.mutate(|entries| {
            entries.insert((local_path, remote.clone()), entry);
        })
    }

    /// Forget every entry for a local path
    pub fn invalidate(&self, local_path: &Path) -> Result<()> {
        let local_path = normalize(local_path);
        self.mutate(|entries| {
            entries.retain(|(path, _), _| path != &local_path);
        })
    }

    /// Snapshot of all entries, sorted by path
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = read_lock(&self.entries).values().cloned().collect();
        entries.sort_by(|a, b| {
            a.local_path
                .cmp(&b.local_path)
                .then_with(|| a.remote.cmp(&b.remote))
        });
        entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist any changes a previous write failed to save
    pub fn flush(&self) -> Result<()> {
        let mut dirty = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if *dirty {
            self.persist()?;
            *dirty = false;
        }
        Ok(())
    }

    fn mutate(&self, change: impl FnOnce(&mut HashMap<CacheKey, CacheEntry>)) -> Result<()> {
        let mut dirty = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            change(&mut entries);
        }

        match self.persist() {
            Ok(()) => {
                *dirty = false;
                Ok(())
            }
            Err(e) => {
                *dirty = true;
                Err(e)
            }
        }
    }

    /// Write the whole index to a temp file and rename it into place
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let index = CacheIndex {
            version: Self::VERSION,
            entries: self.entries(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }

        let temp_path = temp_sibling(path);
        let result = (|| {
            let file = File::create(&temp_path).with_path(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &index)
                .map_err(|e| TransferError::Cache(e.to_string()))?;
            writer.flush().with_path(&temp_path)?;
            writer
                .into_inner()
                .map_err(|e| TransferError::io(&temp_path, e.into_error()))?
                .sync_all()
                .with_path(&temp_path)?;
            std::fs::rename(&temp_path, path).with_path(path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }
        result
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashAlgorithm;
    use crate::hash::hash_bytes;
    use tempfile::tempdir;

    fn stamp(secs: i64) -> FileStamp {
        FileStamp { secs, nanos: 0 }
    }

    #[test]
    fn test_record_and_lookup_survive_reopen() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("cache.json");
        let local = dir.path().join("data.bin");
        let remote = RemoteId::new("bucket/data.bin");
        let digest = hash_bytes(b"data", HashAlgorithm::Sha256);

        let cache = TransferCache::open(&index);
        assert!(cache.lookup(&local, &remote).is_none());
        cache.record(&local, &remote, digest.clone(), 4, stamp(100)).unwrap();

        let reopened = TransferCache::open(&index);
        let entry = reopened.lookup(&local, &remote).unwrap();
        assert_eq!(entry.digest, digest);
        assert_eq!(entry.size, 4);
        assert!(entry.matches_metadata(4, stamp(100)));
        assert!(!entry.matches_metadata(4, stamp(101)));
    }

    #[test]
    fn test_keyed_by_path_and_remote() {
        let cache = TransferCache::in_memory();
        let local = PathBuf::from("/data/a.bin");
        let digest = hash_bytes(b"a", HashAlgorithm::Sha256);

        cache
            .record(&local, &RemoteId::new("one"), digest.clone(), 1, stamp(1))
            .unwrap();
        assert!(cache.lookup(&local, &RemoteId::new("one")).is_some());
        assert!(cache.lookup(&local, &RemoteId::new("two")).is_none());
    }

    #[test]
    fn test_invalidate_removes_all_remotes_for_path() {
        let cache = TransferCache::in_memory();
        let local = PathBuf::from("/data/a.bin");
        let other = PathBuf::from("/data/b.bin");
        let digest = hash_bytes(b"a", HashAlgorithm::Sha256);

        for remote in ["x", "y"] {
            cache
                .record(&local, &RemoteId::new(remote), digest.clone(), 1, stamp(1))
                .unwrap();
        }
        cache
            .record(&other, &RemoteId::new("x"), digest, 1, stamp(1))
            .unwrap();

        cache.invalidate(&local).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&other, &RemoteId::new("x")).is_some());
    }

    #[test]
    fn test_corrupt_index_is_empty_cache() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("cache.json");
        std::fs::write(&index, b"{ not json").unwrap();

        let cache = TransferCache::open(&index);
        assert!(cache.is_empty());

        // and it recovers on the next write
        cache
            .record(
                Path::new("/data/a.bin"),
                &RemoteId::new("a"),
                hash_bytes(b"a", HashAlgorithm::Sha256),
                1,
                stamp(1),
            )
            .unwrap();
        assert_eq!(TransferCache::open(&index).len(), 1);
    }

    #[test]
    fn test_unknown_version_is_empty_cache() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("cache.json");
        std::fs::write(&index, br#"{"version": 99, "entries": []}"#).unwrap();
        assert!(TransferCache::open(&index).is_empty());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("cache.json");
        let cache = TransferCache::open(&index);
        for i in 0..5 {
            cache
                .record(
                    Path::new(&format!("/data/{i}.bin")),
                    &RemoteId::new(format!("r{i}")),
                    hash_bytes(&[i as u8], HashAlgorithm::Sha256),
                    1,
                    stamp(i),
                )
                .unwrap();
        }
        cache.flush().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("cache.json")]);
    }

    #[test]
    fn test_concurrent_writers_do_not_corrupt() {
        let dir = tempdir().unwrap();
        let index = dir.path().join("cache.json");
        let cache = std::sync::Arc::new(TransferCache::open(&index));

        std::thread::scope(|scope| {
            for t in 0..4 {
                let cache = std::sync::Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..10 {
                        cache
                            .record(
                                Path::new(&format!("/data/{t}-{i}.bin")),
                                &RemoteId::new("r"),
                                hash_bytes(&[t, i], HashAlgorithm::XXHash3),
                                2,
                                stamp(i as i64),
                            )
                            .unwrap();
                        let _ = cache.lookup(Path::new("/data/0-0.bin"), &RemoteId::new("r"));
                    }
                });
            }
        });

        assert_eq!(TransferCache::open(&index).len(), 40);
    }
}
