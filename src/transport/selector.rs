//! Credential/transport selection
//!
//! Picks the transport for one transfer. Direct transport is preferred when
//! it is enabled, the connector supports the remote and a lease can be
//! issued; any failure on that path falls back to the managed transport.

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::transport::direct::DirectTransport;
use crate::transport::lease::{CredentialLease, LeaseCache};
use crate::transport::traits::{
    CredentialProvider, DirectConnector, Direction, RemoteId, Transport, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;

/// A selected transport and the strategy it implements
#[derive(Clone)]
pub struct TransportHandle {
    /// Strategy
    pub kind: TransportKind,
    /// The transport itself
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").field("kind", &self.kind).finish()
    }
}

struct DirectBackend {
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<dyn DirectConnector>,
}

/// Chooses between managed and direct transport per transfer
pub struct TransportSelector {
    managed: Option<Arc<dyn Transport>>,
    direct: Option<DirectBackend>,
    direct_enabled: bool,
    refresh_margin: Duration,
    leases: Arc<LeaseCache>,
}

impl TransportSelector {
    /// Create a selector with no transports configured
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            managed: None,
            direct: None,
            direct_enabled: config.enable_direct_transport,
            refresh_margin: config.lease_refresh_margin,
            leases: Arc::new(LeaseCache::new()),
        }
    }

    /// Set the managed transport
    pub fn with_managed(mut self, transport: Arc<dyn Transport>) -> Self {
        self.managed = Some(transport);
        self
    }

    /// Set the direct transport backend
    pub fn with_direct(
        mut self,
        provider: Arc<dyn CredentialProvider>,
        connector: Arc<dyn DirectConnector>,
    ) -> Self {
        self.direct = Some(DirectBackend {
            provider,
            connector,
        });
        self
    }

    /// Select a transport for one transfer
    ///
    /// Returns the lease the direct transport was built from, if any.
    pub fn select(
        &self,
        direction: Direction,
        remote: &RemoteId,
    ) -> Result<(TransportHandle, Option<CredentialLease>)> {
        if let Some((handle, lease)) = self.try_direct(direction, remote) {
            return Ok((handle, Some(lease)));
        }
        Ok((self.managed()?, None))
    }

    /// The managed transport, used directly or as credential-rejection fallback
    pub fn managed(&self) -> Result<TransportHandle> {
        self.managed
            .as_ref()
            .map(|transport| TransportHandle {
                kind: TransportKind::Managed,
                transport: Arc::clone(transport),
            })
            .ok_or_else(|| {
                TransferError::config("no managed transport configured and direct transport unavailable")
            })
    }

    /// Whether a managed transport is configured
    pub fn has_managed(&self) -> bool {
        self.managed.is_some()
    }

    /// Number of cached leases
    pub fn cached_leases(&self) -> usize {
        self.leases.len()
    }

    fn try_direct(
        &self,
        direction: Direction,
        remote: &RemoteId,
    ) -> Option<(TransportHandle, CredentialLease)> {
        if !self.direct_enabled {
            return None;
        }
        let backend = self.direct.as_ref()?;
        if !backend.connector.supports_direct(remote) {
            tracing::debug!("Direct transport not supported for {}", remote);
            return None;
        }

        let scope = direction.scope();
        let lease = match self.leases.obtain(
            backend.provider.as_ref(),
            remote,
            scope,
            self.refresh_margin,
        ) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!("Lease for {} unavailable, using managed transport: {}", remote, e);
                return None;
            }
        };

        match DirectTransport::connect(
            remote.clone(),
            lease.clone(),
            self.refresh_margin,
            Arc::clone(&backend.provider),
            Arc::clone(&backend.connector),
            Arc::clone(&self.leases),
        ) {
            Ok(direct) => {
                tracing::debug!("Using direct transport for {} {}", direction, remote);
                Some((
                    TransportHandle {
                        kind: TransportKind::Direct,
                        transport: Arc::new(direct),
                    },
                    lease,
                ))
            }
            Err(e) => {
                tracing::warn!("Direct connect for {} failed, using managed transport: {}", remote, e);
                self.leases.evict(remote, scope);
                None
            }
        }
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("managed", &self.managed.is_some())
            .field("direct", &self.direct.is_some())
            .field("direct_enabled", &self.direct_enabled)
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}
