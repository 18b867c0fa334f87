//! Transport boundary
//!
//! Everything the engine needs from the outside world: a blocking object
//! transport, a credential lease issuer, a connector that turns a lease into a
//! direct transport, and a metadata registry notified after uploads.

use crate::chunk::ByteRange;
use crate::error::Result;
use crate::hash::Digest;
use crate::transport::lease::{CredentialLease, LeaseScope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Remote object identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a remote id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RemoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RemoteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local file to remote object
    Upload,
    /// Remote object to local file
    Download,
}

impl Direction {
    /// Lease scope a transfer in this direction needs
    pub fn scope(&self) -> LeaseScope {
        match self {
            Self::Upload => LeaseScope::Write,
            Self::Download => LeaseScope::Read,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Which transport strategy is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Requests go through the controlling API
    Managed,
    /// Requests go straight to storage under a credential lease
    Direct,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => f.write_str("managed"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Opaque multipart upload session handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadSessionToken(pub String);

impl std::fmt::Display for UploadSessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receipt for an accepted part, listed again at completion
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartToken {
    /// 0-based part index
    pub index: usize,
    /// Opaque value returned by the remote (an ETag for S3)
    pub etag: String,
}

/// Remote object metadata needed to plan and verify a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object size in bytes
    pub size: u64,
    /// Whole-object content digest, when the remote stores one
    pub digest: Option<Digest>,
}

/// Blocking object transport
///
/// Implementations must be safe to call from many worker threads at once.
/// Errors should be mapped onto the [`TransferError`](crate::error::TransferError)
/// variants the retry policy understands (`Network`, `RateLimited`, `Server`,
/// `Client`, `CredentialRejected`).
pub trait Transport: Send + Sync {
    /// Strategy this transport implements
    fn kind(&self) -> TransportKind;

    /// Start a multipart upload
    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken>;

    /// Upload one part; idempotent per (session, index)
    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        digest: &Digest,
    ) -> Result<PartToken>;

    /// Commit a multipart upload; `parts` are in index order
    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()>;

    /// Discard a multipart upload and its parts
    fn abort_upload(&self, session: &UploadSessionToken, remote: &RemoteId) -> Result<()>;

    /// Upload a whole object in one request
    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()>;

    /// Fetch size and digest of a remote object
    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata>;

    /// Fetch one byte range of a remote object
    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>>;
}

/// Issues short-lived scoped credentials
pub trait CredentialProvider: Send + Sync {
    /// Issue a lease for `remote` with the given scope
    fn issue_lease(&self, remote: &RemoteId, scope: LeaseScope) -> Result<CredentialLease>;
}

/// Builds direct transports from credential leases
pub trait DirectConnector: Send + Sync {
    /// Whether `remote` can be reached directly at all
    fn supports_direct(&self, remote: &RemoteId) -> bool;

    /// Open a transport bound to `lease`
    fn connect(&self, lease: &CredentialLease) -> Result<Arc<dyn Transport>>;
}

/// Metadata registration after a completed upload
pub trait ObjectRegistry: Send + Sync {
    /// Record a new object version
    fn register_object(&self, remote: &RemoteId, size: u64, digest: &Digest) -> Result<()>;
}
