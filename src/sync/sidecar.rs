//! Download resume sidecar
//!
//! A small JSON file next to a download's staging file recording which byte
//! ranges are already durable in it, each with the digest of its bytes. The
//! sidecar is rewritten whole (temp file, then rename) every time a range is
//! added, and a range is only added after its bytes have been fsynced into
//! the staging file.

use crate::chunk::ByteRange;
use crate::error::{IoResultExt, Result, TransferError};
use crate::hash::Digest;
use crate::transport::RemoteId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Staging file for a download destination (`<dest>.partial`)
pub fn staging_path(destination: &Path) -> PathBuf {
    append_extension(destination, ".partial")
}

/// Sidecar for a staging file (`<staging>.json`)
pub fn sidecar_path(staging: &Path) -> PathBuf {
    append_extension(staging, ".json")
}

fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// A range durable in the staging file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRange {
    /// Byte range
    pub range: ByteRange,
    /// Digest of the bytes written for it
    pub digest: Digest,
}

/// Persisted resume state of one download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sidecar {
    /// Format version
    pub version: u32,
    /// Remote object being downloaded
    pub remote: RemoteId,
    /// Object size
    pub total_size: u64,
    /// Remote digest at the time the download started, if the remote has one
    pub digest: Option<Digest>,
    /// Part size the ranges were planned with
    pub part_size: u64,
    /// Ranges durable in the staging file, sorted by range
    pub completed: Vec<DurableRange>,
    /// Last update
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    path: PathBuf,
}

impl Sidecar {
    /// Current format version
    pub const VERSION: u32 = 2;

    /// Start a fresh sidecar and write it to `path`
    pub fn create(
        path: impl Into<PathBuf>,
        remote: RemoteId,
        total_size: u64,
        digest: Option<Digest>,
        part_size: u64,
    ) -> Result<Self> {
        let sidecar = Self {
            version: Self::VERSION,
            remote,
            total_size,
            digest,
            part_size,
            completed: Vec::new(),
            updated_at: Utc::now(),
            path: path.into(),
        };
        sidecar.save()?;
        Ok(sidecar)
    }

    /// Load the sidecar at `path`
    ///
    /// A missing file is `Ok(None)`. An unreadable or corrupt one is also
    /// `Ok(None)` after a warning, since it can only cost a re-download.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::io(path, e)),
        };

        match serde_json::from_reader::<_, Sidecar>(BufReader::new(file)) {
            Ok(mut sidecar) if sidecar.version == Self::VERSION => {
                sidecar.path = path.to_path_buf();
                Ok(Some(sidecar))
            }
            Ok(sidecar) => {
                tracing::warn!(
                    "Ignoring sidecar {} with unsupported version {}",
                    path.display(),
                    sidecar.version
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Ignoring corrupt sidecar {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Whether this sidecar describes the same object version
    ///
    /// Without a remote digest only identity and size can be compared.
    pub fn matches(&self, remote: &RemoteId, total_size: u64, digest: Option<&Digest>) -> bool {
        &self.remote == remote && self.total_size == total_size && self.digest.as_ref() == digest
    }

    fn position(&self, range: &ByteRange) -> std::result::Result<usize, usize> {
        self.completed.binary_search_by(|durable| durable.range.cmp(range))
    }

    /// Whether a range is recorded as durable
    pub fn is_completed(&self, range: &ByteRange) -> bool {
        self.position(range).is_ok()
    }

    /// Digest recorded for a durable range
    pub fn range_digest(&self, range: &ByteRange) -> Option<&Digest> {
        self.position(range).ok().map(|pos| &self.completed[pos].digest)
    }

    /// Bytes recorded as durable
    pub fn completed_bytes(&self) -> u64 {
        self.completed.iter().map(|durable| durable.range.len()).sum()
    }

    /// Record a durable range and persist
    pub fn record_range(&mut self, range: ByteRange, digest: Digest) -> Result<()> {
        if range.end > self.total_size {
            return Err(TransferError::Sidecar(format!(
                "range {} beyond object size {}",
                range, self.total_size
            )));
        }
        match self.position(&range) {
            Ok(pos) if self.completed[pos].digest == digest => return Ok(()),
            Ok(pos) => self.completed[pos].digest = digest,
            Err(pos) => self.completed.insert(pos, DurableRange { range, digest }),
        }
        self.updated_at = Utc::now();
        self.save()
    }

    /// Forget a range whose bytes can no longer be trusted
    pub fn forget_range(&mut self, range: &ByteRange) -> Result<()> {
        if let Ok(pos) = self.position(range) {
            self.completed.remove(pos);
            self.updated_at = Utc::now();
            self.save()?;
        }
        Ok(())
    }

    /// Path of the sidecar file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the sidecar file
    pub fn discard(self) -> Result<()> {
        Self::remove(&self.path)
    }

    /// Remove a sidecar file by path; missing is fine
    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::io(path, e)),
        }
    }

    fn save(&self) -> Result<()> {
        let temp_path = append_extension(&self.path, ".tmp");
        let file = File::create(&temp_path).with_path(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| TransferError::Sidecar(e.to_string()))?;
        writer.flush().with_path(&temp_path)?;
        writer
            .into_inner()
            .map_err(|e| TransferError::io(&temp_path, e.into_error()))?
            .sync_all()
            .with_path(&temp_path)?;
        std::fs::rename(&temp_path, &self.path).with_path(&self.path)
    }
}
