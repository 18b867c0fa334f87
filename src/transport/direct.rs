//! Lease-bound direct transport
//!
//! Wraps the transport produced by a [`DirectConnector`] together with the
//! lease it was built from. Before every call the lease is checked against
//! the refresh margin; a lease about to expire is replaced, together with the
//! transport bound to it, before the call goes out.

use crate::chunk::ByteRange;
use crate::error::Result;
use crate::hash::Digest;
use crate::transport::lease::{CredentialLease, LeaseCache, LeaseScope};
use crate::transport::traits::{
    CredentialProvider, DirectConnector, ObjectMetadata, PartToken, RemoteId, Transport,
    TransportKind, UploadSessionToken,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct Binding {
    lease: CredentialLease,
    transport: Arc<dyn Transport>,
}

/// Direct transport that refreshes its lease by replacement
pub struct DirectTransport {
    remote: RemoteId,
    scope: LeaseScope,
    margin: Duration,
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<dyn DirectConnector>,
    leases: Arc<LeaseCache>,
    binding: RwLock<Binding>,
    refreshes: AtomicU64,
}

impl DirectTransport {
    /// Connect using an already-issued lease
    pub fn connect(
        remote: RemoteId,
        lease: CredentialLease,
        margin: Duration,
        provider: Arc<dyn CredentialProvider>,
        connector: Arc<dyn DirectConnector>,
        leases: Arc<LeaseCache>,
    ) -> Result<Self> {
        let transport = connector.connect(&lease)?;
        Ok(Self {
            remote,
            scope: lease.scope,
            margin,
            provider,
            connector,
            leases,
            binding: RwLock::new(Binding { lease, transport }),
            refreshes: AtomicU64::new(0),
        })
    }

    /// The lease currently in use
    pub fn lease(&self) -> CredentialLease {
        self.binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lease
            .clone()
    }

    /// How many times the lease has been replaced
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Current transport, refreshing the lease first if needed
    fn current(&self) -> Result<Arc<dyn Transport>> {
        {
            let binding = self.binding.read().unwrap_or_else(|e| e.into_inner());
            if !binding.lease.expires_within(self.margin) {
                return Ok(Arc::clone(&binding.transport));
            }
        }

        let mut binding = self.binding.write().unwrap_or_else(|e| e.into_inner());
        // Another worker may have refreshed while we waited for the lock
        if binding.lease.expires_within(self.margin) {
            let lease = self.leases.obtain(
                self.provider.as_ref(),
                &self.remote,
                self.scope,
                self.margin,
            )?;
            let transport = self.connector.connect(&lease)?;
            tracing::debug!(
                "Refreshed direct lease for {} (valid until {})",
                self.remote,
                lease.expires_at
            );
            *binding = Binding { lease, transport };
            self.refreshes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::clone(&binding.transport))
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken> {
        self.current()?.open_upload(remote)
    }

    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        digest: &Digest,
    ) -> Result<PartToken> {
        self.current()?.put_part(session, index, data, digest)
    }

    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()> {
        self.current()?.complete_upload(session, remote, parts, digest)
    }

    fn abort_upload(&self, session: &UploadSessionToken, remote: &RemoteId) -> Result<()> {
        self.current()?.abort_upload(session, remote)
    }

    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()> {
        self.current()?.put_object(remote, data, digest)
    }

    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata> {
        self.current()?.get_object_metadata(remote)
    }

    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>> {
        self.current()?.get_range(remote, range)
    }
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("remote", &self.remote)
            .field("lease", &self.lease())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}
