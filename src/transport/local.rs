//! Filesystem-backed object store
//!
//! A directory laid out like a tiny object store:
//!
//! ```text
//! <root>/objects/<key>          object bytes
//! <root>/meta/<key>.json        size and digest
//! <root>/uploads/<session>/     in-progress multipart uploads
//! <root>/registry/<key>.json    registered object versions
//! ```
//!
//! The store doubles as credential provider and direct connector: its direct
//! view checks the lease on every call and rejects expired or under-scoped
//! leases the way a real storage endpoint would.

use crate::chunk::ByteRange;
use crate::error::{Result, TransferError};
use crate::hash::{hash_bytes, Digest, StreamingHasher};
use crate::transport::lease::{CredentialLease, LeaseScope};
use crate::transport::traits::{
    CredentialProvider, DirectConnector, ObjectMetadata, ObjectRegistry, PartToken, RemoteId,
    Transport, TransportKind, UploadSessionToken,
};
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const UPLOADS_DIR: &str = "uploads";
const REGISTRY_DIR: &str = "registry";

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    size: u64,
    digest: Digest,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadManifest {
    remote: RemoteId,
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    lease_ttl: Duration,
    direct: bool,
    leases_issued: Arc<AtomicU64>,
}

impl LocalObjectStore {
    /// Open (and create if needed) a store at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, META_DIR, UPLOADS_DIR, REGISTRY_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| TransferError::io(&path, e))?;
        }
        Ok(Self {
            root,
            lease_ttl: Duration::from_secs(15 * 60),
            direct: true,
            leases_issued: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Lifetime of issued leases
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Whether the store offers direct access
    pub fn with_direct(mut self, enabled: bool) -> Self {
        self.direct = enabled;
        self
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of leases issued so far
    pub fn leases_issued(&self) -> u64 {
        self.leases_issued.load(Ordering::SeqCst)
    }

    /// Whether an object exists
    pub fn contains(&self, remote: &RemoteId) -> bool {
        self.object_path(remote).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Read a whole object
    pub fn read_object(&self, remote: &RemoteId) -> Result<Vec<u8>> {
        let path = self.object_path(remote)?;
        fs::read(&path).map_err(|e| store_error(&path, e))
    }

    /// Registered metadata for an object, if it was registered
    pub fn registration(&self, remote: &RemoteId) -> Result<Option<ObjectMetadata>> {
        let path = self.keyed_path(REGISTRY_DIR, remote, Some("json"))?;
        match fs::read_to_string(&path) {
            Ok(json) => {
                let meta: StoredMeta = serde_json::from_str(&json)
                    .map_err(|e| TransferError::Server {
                        status: 500,
                        message: format!("corrupt registry entry: {e}"),
                    })?;
                Ok(Some(ObjectMetadata {
                    size: meta.size,
                    digest: Some(meta.digest),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error(&path, e)),
        }
    }

    /// Multipart uploads that are neither completed nor aborted
    pub fn pending_uploads(&self) -> Result<usize> {
        let dir = self.root.join(UPLOADS_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| store_error(&dir, e))?;
        Ok(entries.filter_map(|e| e.ok()).count())
    }

    fn object_path(&self, remote: &RemoteId) -> Result<PathBuf> {
        self.keyed_path(OBJECTS_DIR, remote, None)
    }

    fn meta_path(&self, remote: &RemoteId) -> Result<PathBuf> {
        self.keyed_path(META_DIR, remote, Some("json"))
    }

    fn keyed_path(&self, dir: &str, remote: &RemoteId, extension: Option<&str>) -> Result<PathBuf> {
        let key = Path::new(remote.as_str());
        let valid = !remote.as_str().is_empty()
            && key.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(TransferError::Client {
                status: 400,
                message: format!("invalid object key '{}'", remote),
            });
        }

        let mut path = self.root.join(dir).join(key);
        if let Some(ext) = extension {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".");
            name.push(ext);
            path.set_file_name(name);
        }
        Ok(path)
    }

    fn upload_dir(&self, session: &UploadSessionToken) -> Result<PathBuf> {
        if session.0.is_empty() || !session.0.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::Client {
                status: 400,
                message: format!("invalid upload session '{}'", session),
            });
        }
        Ok(self.root.join(UPLOADS_DIR).join(&session.0))
    }

    /// Write `data` to `path` through a temp file and rename
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| store_error(parent, e))?;
        }
        let temp = temp_path(path);
        let result = (|| {
            let mut file = File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&temp, path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(store_error(path, e));
        }
        Ok(())
    }

    fn write_meta(&self, remote: &RemoteId, size: u64, digest: &Digest) -> Result<()> {
        let meta = StoredMeta {
            size,
            digest: digest.clone(),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| TransferError::Server {
            status: 500,
            message: e.to_string(),
        })?;
        Self::write_atomic(&self.meta_path(remote)?, &json)
    }

    fn check_digest(data: &[u8], expected: &Digest, what: &str) -> Result<()> {
        let actual = hash_bytes(data, expected.algorithm);
        if &actual != expected {
            return Err(TransferError::Client {
                status: 400,
                message: format!("{what} digest mismatch: expected {expected}, got {actual}"),
            });
        }
        Ok(())
    }

    fn part_file(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("part-{index:05}"))
    }
}

impl Transport for LocalObjectStore {
    fn kind(&self) -> TransportKind {
        TransportKind::Managed
    }

    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken> {
        // validate the key before creating anything
        self.object_path(remote)?;

        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let session = UploadSessionToken(hex::encode(id));

        let dir = self.upload_dir(&session)?;
        fs::create_dir_all(&dir).map_err(|e| store_error(&dir, e))?;
        let manifest = serde_json::to_vec(&UploadManifest {
            remote: remote.clone(),
        })
        .map_err(|e| TransferError::Server {
            status: 500,
            message: e.to_string(),
        })?;
        Self::write_atomic(&dir.join("upload.json"), &manifest)?;

        tracing::debug!("Opened upload {} for {}", session, remote);
        Ok(session)
    }

    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        digest: &Digest,
    ) -> Result<PartToken> {
        let dir = self.upload_dir(session)?;
        if !dir.is_dir() {
            return Err(TransferError::Client {
                status: 404,
                message: format!("no such upload '{}'", session),
            });
        }
        Self::check_digest(data, digest, "part")?;

        // idempotent: re-uploading a part overwrites it
        Self::write_atomic(&Self::part_file(&dir, index), data)?;
        Ok(PartToken {
            index,
            etag: digest.hex.clone(),
        })
    }

    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()> {
        let dir = self.upload_dir(session)?;
        if !dir.is_dir() {
            return Err(TransferError::Client {
                status: 404,
                message: format!("no such upload '{}'", session),
            });
        }
        if parts.is_empty() || parts.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(TransferError::Client {
                status: 400,
                message: "parts must be listed in ascending index order".to_string(),
            });
        }

        let object = self.object_path(remote)?;
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent).map_err(|e| store_error(parent, e))?;
        }
        let temp = temp_path(&object);
        let mut output = File::create(&temp).map_err(|e| store_error(&temp, e))?;
        let mut hasher = StreamingHasher::new(digest.algorithm);
        let mut size = 0u64;

        let assembled = (|| -> Result<()> {
            for token in parts {
                let path = Self::part_file(&dir, token.index);
                let data = fs::read(&path).map_err(|e| store_error(&path, e))?;
                if hash_bytes(&data, digest.algorithm).hex != token.etag {
                    return Err(TransferError::Client {
                        status: 400,
                        message: format!("part {} does not match its token", token.index),
                    });
                }
                hasher.process(&data);
                output.write_all(&data).map_err(|e| store_error(&temp, e))?;
                size += data.len() as u64;
            }
            output.sync_all().map_err(|e| store_error(&temp, e))
        })();
        if let Err(e) = assembled {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        drop(output);

        let actual = hasher.finalize();
        if &actual != digest {
            let _ = fs::remove_file(&temp);
            return Err(TransferError::Client {
                status: 400,
                message: format!("object digest mismatch: expected {digest}, got {actual}"),
            });
        }

        fs::rename(&temp, &object).map_err(|e| store_error(&object, e))?;
        self.write_meta(remote, size, digest)?;
        fs::remove_dir_all(&dir).map_err(|e| store_error(&dir, e))?;

        tracing::debug!("Completed upload {} for {} ({} parts)", session, remote, parts.len());
        Ok(())
    }

    fn abort_upload(&self, session: &UploadSessionToken, remote: &RemoteId) -> Result<()> {
        let dir = self.upload_dir(session)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!("Aborted upload {} for {}", session, remote);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&dir, e)),
        }
    }

    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()> {
        Self::check_digest(data, digest, "object")?;
        Self::write_atomic(&self.object_path(remote)?, data)?;
        self.write_meta(remote, data.len() as u64, digest)
    }

    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata> {
        let path = self.meta_path(remote)?;
        let json = fs::read_to_string(&path).map_err(|e| store_error(&path, e))?;
        let meta: StoredMeta = serde_json::from_str(&json).map_err(|e| TransferError::Server {
            status: 500,
            message: format!("corrupt metadata for '{}': {}", remote, e),
        })?;
        Ok(ObjectMetadata {
            size: meta.size,
            digest: Some(meta.digest),
        })
    }

    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>> {
        let path = self.object_path(remote)?;
        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| store_error(&path, e))?;
        let size = file.metadata().map_err(|e| store_error(&path, e))?.len();
        if range.end > size || range.is_empty() {
            return Err(TransferError::Client {
                status: 416,
                message: format!("range {} not satisfiable for {} bytes", range, size),
            });
        }

        let mut buffer = vec![0u8; range.len() as usize];
        file.seek(SeekFrom::Start(range.start))
            .and_then(|_| file.read_exact(&mut buffer))
            .map_err(|e| store_error(&path, e))?;
        Ok(buffer)
    }
}

impl CredentialProvider for LocalObjectStore {
    fn issue_lease(&self, remote: &RemoteId, scope: LeaseScope) -> Result<CredentialLease> {
        self.object_path(remote)?;
        let ttl = chrono::Duration::from_std(self.lease_ttl)
            .map_err(|e| TransferError::config(format!("lease ttl out of range: {e}")))?;

        let mut token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);
        self.leases_issued.fetch_add(1, Ordering::SeqCst);

        Ok(CredentialLease::new(
            scope,
            format!("file://{}", self.root.display()),
            Utc::now() + ttl,
        )
        .with_field("object", remote.as_str())
        .with_field("token", hex::encode(token)))
    }
}

impl DirectConnector for LocalObjectStore {
    fn supports_direct(&self, _remote: &RemoteId) -> bool {
        self.direct
    }

    fn connect(&self, lease: &CredentialLease) -> Result<Arc<dyn Transport>> {
        if !self.direct {
            return Err(TransferError::config("direct access disabled for this store"));
        }
        Ok(Arc::new(LeaseBoundStore {
            store: self.clone(),
            lease: lease.clone(),
        }))
    }
}

impl ObjectRegistry for LocalObjectStore {
    fn register_object(&self, remote: &RemoteId, size: u64, digest: &Digest) -> Result<()> {
        let meta = StoredMeta {
            size,
            digest: digest.clone(),
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|e| TransferError::Registration {
            remote: remote.to_string(),
            message: e.to_string(),
        })?;
        Self::write_atomic(&self.keyed_path(REGISTRY_DIR, remote, Some("json"))?, &json)
    }
}

/// Direct view of a [`LocalObjectStore`] that enforces a credential lease
struct LeaseBoundStore {
    store: LocalObjectStore,
    lease: CredentialLease,
}

impl LeaseBoundStore {
    fn authorize(&self, remote: Option<&RemoteId>, required: LeaseScope) -> Result<()> {
        if self.lease.is_expired() {
            return Err(TransferError::CredentialRejected(format!(
                "lease expired at {}",
                self.lease.expires_at
            )));
        }
        if !self.lease.scope.allows(required) {
            return Err(TransferError::CredentialRejected(format!(
                "lease scope {:?} does not allow {:?}",
                self.lease.scope, required
            )));
        }
        if let Some(remote) = remote {
            if self.lease.field("object") != Some(remote.as_str()) {
                return Err(TransferError::CredentialRejected(format!(
                    "lease not valid for '{}'",
                    remote
                )));
            }
        }
        Ok(())
    }
}

impl Transport for LeaseBoundStore {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken> {
        self.authorize(Some(remote), LeaseScope::Write)?;
        self.store.open_upload(remote)
    }

    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        digest: &Digest,
    ) -> Result<PartToken> {
        self.authorize(None, LeaseScope::Write)?;
        self.store.put_part(session, index, data, digest)
    }

    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()> {
        self.authorize(Some(remote), LeaseScope::Write)?;
        self.store.complete_upload(session, remote, parts, digest)
    }

    fn abort_upload(&self, session: &UploadSessionToken, remote: &RemoteId) -> Result<()> {
        self.authorize(Some(remote), LeaseScope::Write)?;
        self.store.abort_upload(session, remote)
    }

    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()> {
        self.authorize(Some(remote), LeaseScope::Write)?;
        self.store.put_object(remote, data, digest)
    }

    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata> {
        self.authorize(Some(remote), LeaseScope::Read)?;
        self.store.get_object_metadata(remote)
    }

    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>> {
        self.authorize(Some(remote), LeaseScope::Read)?;
        self.store.get_range(remote, range)
    }
}

/// Map a store-side I/O error onto a remote-style status
fn store_error(path: &Path, err: io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::NotFound => TransferError::Client {
            status: 404,
            message: format!("'{}' not found", path.display()),
        },
        _ => TransferError::Server {
            status: 500,
            message: format!("{}: {}", path.display(), err),
        },
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", hex::encode(suffix)));
    path.with_file_name(name)
}
