//! Transfer session facade
//!
//! One session owns the validated configuration, the global worker limiter,
//! the retry policy and the transport selector, and borrows the shared
//! transfer cache. Every transfer goes through the same pipeline:
//!
//! 1. cache check (digest always recomputed)
//! 2. transport selection
//! 3. upload or download coordinator
//! 4. registration and cache update on success
//!
//! A credential rejection on the direct transport is retried once, as a
//! whole transfer, on the managed transport.

use crate::config::TransferConfig;
use crate::core::dispatch::{CoordinatorOutcome, TransferContext, TransferSummary};
use crate::core::download::DownloadCoordinator;
use crate::core::pool::ConcurrencyLimiter;
use crate::core::state::{CancellationToken, TransferRequest};
use crate::core::upload::UploadCoordinator;
use crate::error::{ReasonCode, Result, TransferError};
use crate::fs::BandwidthLimiter;
use crate::hash::{hash_file, Digest};
use crate::progress::{EventSink, TransferEvent};
use crate::retry::RetryPolicy;
use crate::sync::{FileStamp, TransferCache};
use crate::transport::{
    Direction, ObjectRegistry, RemoteId, TransportHandle, TransportKind, TransportSelector,
};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal status of a transfer that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Bytes moved and verified
    Completed,
    /// Cache hit; nothing moved
    Skipped,
    /// Stopped by the caller
    Cancelled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to one transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Remote object
    pub remote: RemoteId,
    /// Upload or download
    pub direction: Direction,
    /// How the transfer ended
    pub status: TransferStatus,
    /// Transport that moved the bytes; `None` for cache hits
    pub transport: Option<TransportKind>,
    /// Payload size in bytes
    pub size: u64,
    /// Whole-object digest, when known
    pub digest: Option<Digest>,
    /// Bytes moved in this run
    pub bytes_transferred: u64,
    /// Parts or ranges in the plan
    pub parts: usize,
    /// Wall time of the transfer
    pub elapsed: Duration,
}

impl TransferOutcome {
    fn new(request: &TransferRequest, status: TransferStatus, started: Instant) -> Self {
        Self {
            remote: request.remote.clone(),
            direction: request.direction,
            status,
            transport: None,
            size: 0,
            digest: None,
            bytes_transferred: 0,
            parts: 0,
            elapsed: started.elapsed(),
        }
    }

    fn skipped(request: &TransferRequest, size: u64, digest: Digest, started: Instant) -> Self {
        Self {
            size,
            digest: Some(digest),
            ..Self::new(request, TransferStatus::Skipped, started)
        }
    }

    fn completed(
        request: &TransferRequest,
        kind: TransportKind,
        summary: TransferSummary,
        started: Instant,
    ) -> Self {
        Self {
            transport: Some(kind),
            size: summary.size,
            digest: Some(summary.digest),
            bytes_transferred: summary.bytes_transferred,
            parts: summary.parts,
            ..Self::new(request, TransferStatus::Completed, started)
        }
    }
}

/// Entry point for uploads and downloads
pub struct TransferSession {
    config: TransferConfig,
    cache: Arc<TransferCache>,
    selector: TransportSelector,
    registry: Option<Arc<dyn ObjectRegistry>>,
    limiter: ConcurrencyLimiter,
    policy: RetryPolicy,
    events: EventSink,
    throttle: Option<BandwidthLimiter>,
}

impl TransferSession {
    /// Build a session; the configuration is validated here, once
    pub fn new(config: TransferConfig, cache: Arc<TransferCache>, selector: TransportSelector) -> Result<Self> {
        config.validate().map_err(TransferError::Config)?;

        let throttle = config.bandwidth_limit.map(BandwidthLimiter::new);
        if let Some(limit) = config.bandwidth_limit {
            tracing::info!(
                "Bandwidth limited to {}/s",
                humansize::format_size(limit, humansize::BINARY)
            );
        }

        Ok(Self {
            limiter: ConcurrencyLimiter::new(config.max_concurrency),
            policy: RetryPolicy::from_config(&config),
            config,
            cache,
            selector,
            registry: None,
            events: EventSink::disabled(),
            throttle,
        })
    }

    /// Register completed uploads with a metadata service
    pub fn with_registry(mut self, registry: Arc<dyn ObjectRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Emit progress events into `events`
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Replace the retry policy derived from the configuration
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validated configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Global worker limiter, shared by every transfer of this session
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Shared transfer cache
    pub fn cache(&self) -> &Arc<TransferCache> {
        &self.cache
    }

    /// Run one transfer to completion
    pub fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        self.transfer_with_cancel(request, &CancellationToken::new())
    }

    /// Run one transfer that stops cooperatively when `cancel` fires
    pub fn transfer_with_cancel(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let started = Instant::now();
        let result = match request.direction {
            Direction::Upload => self.upload(request, cancel, started),
            Direction::Download => self.download(request, cancel, started),
        }
        .map_err(|e| surface(&request.remote, e));

        match &result {
            Ok(outcome) => {
                tracing::debug!(
                    "{} {} {} ({} bytes moved in {:.1?})",
                    outcome.direction,
                    outcome.remote,
                    outcome.status,
                    outcome.bytes_transferred,
                    outcome.elapsed
                );
                self.events.emit(TransferEvent::Finished {
                    remote: outcome.remote.clone(),
                    status: outcome.status,
                    bytes_transferred: outcome.bytes_transferred,
                });
            }
            Err(e) => {
                tracing::error!("{} {} failed: {}", request.direction, request.remote, e);
                self.events.emit(TransferEvent::Failed {
                    remote: request.remote.clone(),
                    reason: e.reason(),
                });
            }
        }
        result
    }

    /// Run many transfers at once; all share this session's limiter and cache
    pub fn transfer_batch(&self, requests: &[TransferRequest]) -> Result<Vec<Result<TransferOutcome>>> {
        self.transfer_batch_with_cancel(requests, &CancellationToken::new())
    }

    /// [`transfer_batch`](Self::transfer_batch) with a shared cancellation token
    pub fn transfer_batch_with_cancel(
        &self,
        requests: &[TransferRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<Result<TransferOutcome>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let threads = self.config.max_concurrency.min(requests.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("bulkxfer-batch-{i}"))
            .build()
            .map_err(|e| TransferError::config(format!("failed to build batch pool: {e}")))?;

        tracing::info!("Starting batch of {} transfers on {} threads", requests.len(), threads);
        Ok(pool.install(|| {
            requests
                .par_iter()
                .map(|request| self.transfer_with_cancel(request, cancel))
                .collect()
        }))
    }

    /// Flush the cache; call once before dropping the session
    pub fn shutdown(&self) -> Result<()> {
        self.cache.flush()?;
        tracing::debug!("Session shut down, peak concurrency {}", self.limiter.peak());
        Ok(())
    }

    fn context<'a>(&'a self, cancel: &'a CancellationToken) -> TransferContext<'a> {
        TransferContext {
            config: &self.config,
            limiter: &self.limiter,
            policy: &self.policy,
            events: &self.events,
            throttle: self.throttle.as_ref(),
            cancel,
        }
    }

    /// Select a transport and run `attempt`, falling back to managed once
    /// if the direct transport's credential is rejected
    fn with_fallback<T>(
        &self,
        request: &TransferRequest,
        attempt: impl Fn(&TransportHandle) -> Result<T>,
    ) -> Result<T> {
        let (handle, lease) = self.selector.select(request.direction, &request.remote)?;
        if let Some(lease) = &lease {
            tracing::debug!(
                "Using direct transport for {} (lease from {} expires {})",
                request.remote,
                lease.authority,
                lease.expires_at
            );
        }

        match attempt(&handle) {
            Err(e)
                if handle.kind == TransportKind::Direct
                    && e.is_credential_rejection()
                    && self.selector.has_managed() =>
            {
                tracing::warn!(
                    "Direct credential rejected for {}, retrying on managed transport: {}",
                    request.remote,
                    e
                );
                attempt(&self.selector.managed()?)
            }
            other => other,
        }
    }

    fn upload(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<TransferOutcome> {
        let path = request.local_path();
        let metadata = std::fs::metadata(path).map_err(|e| {
            TransferError::precondition(format!("cannot read {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(TransferError::precondition(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let size = metadata.len();
        if size == 0 {
            return Err(TransferError::precondition(format!(
                "refusing to upload empty file {}",
                path.display()
            )));
        }
        if let Some(expected) = request.size {
            if expected != size {
                return Err(TransferError::precondition(format!(
                    "{} is {} bytes, request expected {}",
                    path.display(),
                    size,
                    expected
                )));
            }
        }

        let mtime = FileStamp::of(&metadata);
        let digest = hash_file(path, self.config.hash_algorithm).map_err(|e| {
            TransferError::precondition(format!("cannot read {}: {}", path.display(), e))
        })?;

        if self.cache_hit(path, &request.remote, &digest, size, mtime) {
            tracing::info!("Skipping upload of {}: unchanged since last transfer", path.display());
            return Ok(TransferOutcome::skipped(request, size, digest, started));
        }

        let (kind, outcome) = self.with_fallback(request, |handle| {
            UploadCoordinator::new(self.context(cancel), handle)
                .run(request, size, &digest)
                .map(|outcome| (handle.kind, outcome))
        })?;

        let summary = match outcome {
            CoordinatorOutcome::Completed(summary) => summary,
            CoordinatorOutcome::Cancelled => {
                return Ok(TransferOutcome::new(request, TransferStatus::Cancelled, started))
            }
        };

        if let Some(registry) = &self.registry {
            registry
                .register_object(&request.remote, size, &digest)
                .map_err(|e| {
                    TransferError::Registration {
                        remote: request.remote.to_string(),
                        message: e.to_string(),
                    }
                    .into_transfer_failed(request.remote.as_str(), ReasonCode::RegistrationFailed)
                })?;
        }

        self.record(path, &request.remote, digest, size, mtime);
        Ok(TransferOutcome::completed(request, kind, summary, started))
    }

    fn download(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<TransferOutcome> {
        let destination = request.local_path();

        let result = self.with_fallback(request, |handle| {
            let coordinator = DownloadCoordinator::new(self.context(cancel), handle);
            let Some(meta) = coordinator.metadata(&request.remote)? else {
                return Ok(None);
            };

            if let Some(skipped) = self.download_cache_hit(request, meta.digest.as_ref(), meta.size, started) {
                return Ok(Some(skipped));
            }

            let outcome = coordinator.run(request, &meta)?;
            Ok(Some(match outcome {
                CoordinatorOutcome::Completed(summary) => {
                    TransferOutcome::completed(request, handle.kind, summary, started)
                }
                CoordinatorOutcome::Cancelled => {
                    TransferOutcome::new(request, TransferStatus::Cancelled, started)
                }
            }))
        });

        let outcome = match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Ok(TransferOutcome::new(request, TransferStatus::Cancelled, started)),
            Err(e) => {
                if e.reason() == ReasonCode::ChecksumMismatch {
                    if let Err(cache_err) = self.cache.invalidate(destination) {
                        tracing::warn!("Failed to invalidate cache entry: {}", cache_err);
                    }
                }
                return Err(e);
            }
        };

        if outcome.status == TransferStatus::Completed {
            if let Some(digest) = &outcome.digest {
                match FileStamp::of_path(destination) {
                    Ok(mtime) => {
                        self.record(destination, &request.remote, digest.clone(), outcome.size, mtime)
                    }
                    Err(e) => tracing::warn!("Not caching {}: {}", destination.display(), e),
                }
            }
        }
        Ok(outcome)
    }

    /// Upload skip check against a freshly computed digest
    fn cache_hit(&self, path: &Path, remote: &RemoteId, digest: &Digest, size: u64, mtime: FileStamp) -> bool {
        let Some(entry) = self.cache.lookup(path, remote) else {
            return false;
        };

        if &entry.digest != digest || entry.size != size {
            tracing::info!(
                "Content of {} changed since last transfer ({} -> {})",
                path.display(),
                entry.digest.short(),
                digest.short()
            );
            return false;
        }

        if !entry.matches_metadata(size, mtime) {
            tracing::debug!(
                "Cache entry for {} has stale mtime but matching digest, refreshing",
                path.display()
            );
            self.record(path, remote, digest.clone(), size, mtime);
        }
        true
    }

    /// Download skip check: cached digest equals the remote digest and the
    /// local file still hashes to it. Objects without a remote digest are
    /// always fetched.
    fn download_cache_hit(
        &self,
        request: &TransferRequest,
        remote_digest: Option<&Digest>,
        size: u64,
        started: Instant,
    ) -> Option<TransferOutcome> {
        let Some(remote_digest) = remote_digest else {
            tracing::debug!("{} has no remote digest, not consulting the cache", request.remote);
            return None;
        };
        let path = request.local_path();
        let entry = self.cache.lookup(path, &request.remote)?;
        if &entry.digest != remote_digest || entry.size != size {
            tracing::debug!("Remote {} changed since last download", request.remote);
            return None;
        }

        let metadata = std::fs::metadata(path).ok()?;
        if !metadata.is_file() || metadata.len() != size {
            return None;
        }
        match hash_file(path, remote_digest.algorithm) {
            Ok(local) if &local == remote_digest => {}
            Ok(_) => {
                tracing::info!("Local copy {} modified since last download", path.display());
                return None;
            }
            Err(e) => {
                tracing::warn!("Cannot hash {}: {}", path.display(), e);
                return None;
            }
        }

        let mtime = FileStamp::of(&metadata);
        if !entry.matches_metadata(size, mtime) {
            self.record(path, &request.remote, remote_digest.clone(), size, mtime);
        }
        tracing::info!("Skipping download of {}: local copy is current", request.remote);
        Some(TransferOutcome::skipped(request, size, remote_digest.clone(), started))
    }

    /// Cache failures never fail a transfer
    fn record(&self, path: &Path, remote: &RemoteId, digest: Digest, size: u64, mtime: FileStamp) {
        if let Err(e) = self.cache.record(path, remote, digest, size, mtime) {
            tracing::warn!("Failed to update cache for {}: {}", path.display(), e);
        }
    }
}

/// Wrap an error in a transfer-level failure if it is not one already
fn surface(remote: &RemoteId, err: TransferError) -> TransferError {
    match err {
        TransferError::TransferFailed { .. } => err,
        other => {
            let reason = other.reason();
            other.into_transfer_failed(remote.as_str(), reason)
        }
    }
}
