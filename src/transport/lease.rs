//! Credential leases
//!
//! A lease is a short-lived, scoped credential issued for one remote object.
//! Leases live in memory only; nothing here implements `Serialize`, and the
//! `Debug` output never prints credential fields.

use crate::error::Result;
use crate::transport::traits::{CredentialProvider, RemoteId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// What a lease allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseScope {
    /// Read object metadata and ranges
    Read,
    /// Create and complete uploads (implies read)
    Write,
}

impl LeaseScope {
    /// Whether this scope covers `required`
    pub fn allows(&self, required: LeaseScope) -> bool {
        matches!((self, required), (Self::Write, _) | (Self::Read, Self::Read))
    }
}

/// Short-lived scoped credential
#[derive(Clone)]
pub struct CredentialLease {
    /// Granted scope
    pub scope: LeaseScope,
    /// Endpoint or service the lease is valid for
    pub authority: String,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    fields: HashMap<String, String>,
}

impl CredentialLease {
    /// Create a lease with no credential fields
    pub fn new(scope: LeaseScope, authority: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            authority: authority.into(),
            expires_at,
            fields: HashMap::new(),
        }
    }

    /// Add a credential field (access key, session token, ...)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a credential field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Whether the lease has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Whether the lease expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => Utc::now() + margin >= self.expires_at,
            Err(_) => true,
        }
    }

    /// Time left before expiry (zero when expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or_default()
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        f.debug_struct("CredentialLease")
            .field("scope", &self.scope)
            .field("authority", &self.authority)
            .field("expires_at", &self.expires_at)
            .field("fields", &names)
            .finish()
    }
}

/// In-memory lease cache keyed by (remote, scope)
#[derive(Debug, Default)]
pub struct LeaseCache {
    leases: Mutex<HashMap<(RemoteId, LeaseScope), CredentialLease>>,
}

impl LeaseCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a cached lease that outlives `margin`, or issue and cache a new one
    ///
    /// The provider is called without holding the cache lock, so two threads
    /// missing on the same key may both issue; the later insert wins.
    pub fn obtain(
        &self,
        provider: &dyn CredentialProvider,
        remote: &RemoteId,
        scope: LeaseScope,
        margin: Duration,
    ) -> Result<CredentialLease> {
        let key = (remote.clone(), scope);

        if let Some(lease) = self.lock().get(&key) {
            if !lease.expires_within(margin) {
                return Ok(lease.clone());
            }
            tracing::debug!(
                "Lease for {} ({:?}) expires in {}, re-issuing",
                remote,
                scope,
                humantime::format_duration(lease.remaining())
            );
        }

        let issued = provider.issue_lease(remote, scope);

        let mut leases = self.lock();
        leases.retain(|_, lease| !lease.is_expired());
        match issued {
            Ok(lease) => {
                leases.insert(key, lease.clone());
                Ok(lease)
            }
            Err(e) => {
                leases.remove(&key);
                Err(e)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(RemoteId, LeaseScope), CredentialLease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop the cached lease for (remote, scope)
    pub fn evict(&self, remote: &RemoteId, scope: LeaseScope) {
        self.lock().remove(&(remote.clone(), scope));
    }

    /// Number of cached leases
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingProvider {
        ttl: chrono::Duration,
        issued: AtomicUsize,
    }

    impl CredentialProvider for CountingProvider {
        fn issue_lease(&self, _remote: &RemoteId, scope: LeaseScope) -> Result<CredentialLease> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(CredentialLease::new(scope, "test", Utc::now() + self.ttl)
                .with_field("token", format!("secret-{n}")))
        }
    }

    #[test]
    fn test_debug_redacts_fields() {
        let lease = CredentialLease::new(LeaseScope::Read, "store", Utc::now())
            .with_field("secret_key", "hunter2");
        let debug = format!("{:?}", lease);
        assert!(debug.contains("secret_key"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(lease.field("secret_key"), Some("hunter2"));
    }

    #[test]
    fn test_expiry_margin() {
        let lease = CredentialLease::new(
            LeaseScope::Write,
            "store",
            Utc::now() + chrono::Duration::seconds(30),
        );
        assert!(!lease.is_expired());
        assert!(lease.expires_within(Duration::from_secs(60)));
        assert!(!lease.expires_within(Duration::from_secs(5)));
    }

    #[test]
    fn test_scope_allows() {
        assert!(LeaseScope::Write.allows(LeaseScope::Read));
        assert!(LeaseScope::Read.allows(LeaseScope::Read));
        assert!(!LeaseScope::Read.allows(LeaseScope::Write));
    }

    #[test]
    fn test_cache_reuses_fresh_lease() {
        let provider = CountingProvider {
            ttl: chrono::Duration::hours(1),
            issued: AtomicUsize::new(0),
        };
        let cache = LeaseCache::new();
        let remote = RemoteId::new("obj");

        let first = cache
            .obtain(&provider, &remote, LeaseScope::Read, Duration::from_secs(60))
            .unwrap();
        let second = cache
            .obtain(&provider, &remote, LeaseScope::Read, Duration::from_secs(60))
            .unwrap();
        assert_eq!(first.field("token"), second.field("token"));
        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);

        // different scope is a different lease
        cache
            .obtain(&provider, &remote, LeaseScope::Write, Duration::from_secs(60))
            .unwrap();
        assert_eq!(provider.issued.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_reissues_inside_margin() {
        let provider = CountingProvider {
            ttl: chrono::Duration::seconds(10),
            issued: AtomicUsize::new(0),
        };
        let cache = LeaseCache::new();
        let remote = RemoteId::new("obj");

        cache
            .obtain(&provider, &remote, LeaseScope::Read, Duration::from_secs(60))
            .unwrap();
        let refreshed = cache
            .obtain(&provider, &remote, LeaseScope::Read, Duration::from_secs(60))
            .unwrap();
        assert_eq!(refreshed.field("token"), Some("secret-1"));
        assert_eq!(provider.issued.load(Ordering::SeqCst), 2);
    }

    /// Records whether the cache map was free while a lease was being issued
    struct LockCheckingProvider<'a> {
        cache: &'a LeaseCache,
        unlocked: AtomicBool,
    }

    impl CredentialProvider for LockCheckingProvider<'_> {
        fn issue_lease(&self, _remote: &RemoteId, scope: LeaseScope) -> Result<CredentialLease> {
            self.unlocked
                .store(self.cache.leases.try_lock().is_ok(), Ordering::SeqCst);
            Ok(CredentialLease::new(scope, "test", Utc::now() + chrono::Duration::hours(1)))
        }
    }

    #[test]
    fn test_issue_happens_outside_lock() {
        let cache = LeaseCache::new();
        let provider = LockCheckingProvider {
            cache: &cache,
            unlocked: AtomicBool::new(false),
        };

        cache
            .obtain(&provider, &RemoteId::new("obj"), LeaseScope::Write, Duration::from_secs(60))
            .unwrap();
        assert!(provider.unlocked.load(Ordering::SeqCst));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_leases_pruned_on_insert() {
        let expired = CountingProvider {
            ttl: chrono::Duration::seconds(-1),
            issued: AtomicUsize::new(0),
        };
        let fresh = CountingProvider {
            ttl: chrono::Duration::hours(1),
            issued: AtomicUsize::new(0),
        };
        let cache = LeaseCache::new();

        cache
            .obtain(&expired, &RemoteId::new("done"), LeaseScope::Read, Duration::ZERO)
            .unwrap();
        assert_eq!(cache.len(), 1);

        cache
            .obtain(&fresh, &RemoteId::new("next"), LeaseScope::Read, Duration::ZERO)
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(fresh.issued.load(Ordering::SeqCst), 1);
    }
}
