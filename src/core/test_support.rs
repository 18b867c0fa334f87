//! Shared fixtures for coordinator and session tests

use crate::chunk::ByteRange;
use crate::config::TransferConfig;
use crate::core::state::CancellationToken;
use crate::error::{Result, TransferError};
use crate::hash::Digest;
use crate::transport::{
    LocalObjectStore, ObjectMetadata, PartToken, RemoteId, Transport, TransportKind,
    UploadSessionToken,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transport operation, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    OpenUpload,
    PutPart,
    Complete,
    Abort,
    PutObject,
    Metadata,
    GetRange,
}

/// Injected failure
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Network,
    Server(u16),
    Client(u16),
    RateLimited,
    CredentialRejected,
}

impl Fault {
    fn error(&self, op: Op) -> TransferError {
        match self {
            Fault::Network => TransferError::Network(format!("injected reset in {op:?}")),
            Fault::Server(status) => TransferError::Server {
                status: *status,
                message: format!("injected in {op:?}"),
            },
            Fault::Client(status) => TransferError::Client {
                status: *status,
                message: format!("injected in {op:?}"),
            },
            Fault::RateLimited => TransferError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
                message: format!("injected in {op:?}"),
            },
            Fault::CredentialRejected => {
                TransferError::CredentialRejected(format!("injected in {op:?}"))
            }
        }
    }
}

struct FaultRule {
    op: Op,
    /// Part index for `PutPart`, range start for `GetRange`; `None` matches any
    at: Option<u64>,
    remaining: u32,
    fault: Fault,
}

struct CancelRule {
    op: Op,
    remaining: u32,
    token: CancellationToken,
}

/// Wraps a transport with fault injection and call accounting
pub struct InstrumentedTransport {
    inner: Arc<dyn Transport>,
    strip_digest: bool,
    delay: Duration,
    faults: Mutex<Vec<FaultRule>>,
    cancel: Mutex<Option<CancelRule>>,
    calls: Mutex<HashMap<Op, u32>>,
    fetched: Mutex<Vec<ByteRange>>,
    completions: Mutex<Vec<Vec<usize>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InstrumentedTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            strip_digest: false,
            delay: Duration::ZERO,
            faults: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            fetched: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Report metadata without a content digest
    pub fn without_digest(mut self) -> Self {
        self.strip_digest = true;
        self
    }

    /// Hold every call for `delay` so concurrent calls overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` matching calls with `fault`
    pub fn inject(&self, op: Op, at: Option<u64>, times: u32, fault: Fault) {
        self.faults.lock().unwrap().push(FaultRule {
            op,
            at,
            remaining: times,
            fault,
        });
    }

    /// Cancel `token` once `op` has succeeded `after` times
    pub fn cancel_after(&self, op: Op, after: u32, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(CancelRule {
            op,
            remaining: after,
            token,
        });
    }

    /// Calls made for `op`, including failed ones
    pub fn calls(&self, op: Op) -> u32 {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    /// Total calls of any kind
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    /// Ranges successfully fetched, in call order
    pub fn fetched_ranges(&self) -> Vec<ByteRange> {
        self.fetched.lock().unwrap().clone()
    }

    /// Token indices passed to every completion call
    pub fn completions(&self) -> Vec<Vec<usize>> {
        self.completions.lock().unwrap().clone()
    }

    /// Highest number of overlapping calls observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self, op: Op, at: Option<u64>) -> Result<ActiveGuard<'_>> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = ActiveGuard(&self.active);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut faults = self.faults.lock().unwrap();
        let hit = faults.iter_mut().find(|rule| {
            rule.op == op && rule.remaining > 0 && (rule.at.is_none() || rule.at == at)
        });
        if let Some(rule) = hit {
            rule.remaining -= 1;
            return Err(rule.fault.error(op));
        }
        Ok(guard)
    }

    fn succeeded(&self, op: Op) {
        let mut cancel = self.cancel.lock().unwrap();
        if let Some(rule) = cancel.as_mut() {
            if rule.op == op && rule.remaining > 0 {
                rule.remaining -= 1;
                if rule.remaining == 0 {
                    rule.token.cancel();
                }
            }
        }
    }

    fn observe<T>(&self, op: Op, result: Result<T>) -> Result<T> {
        if result.is_ok() {
            self.succeeded(op);
        }
        result
    }
}

impl Transport for InstrumentedTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn open_upload(&self, remote: &RemoteId) -> Result<UploadSessionToken> {
        let _guard = self.enter(Op::OpenUpload, None)?;
        self.observe(Op::OpenUpload, self.inner.open_upload(remote))
    }

    fn put_part(
        &self,
        session: &UploadSessionToken,
        index: usize,
        data: &[u8],
        digest: &Digest,
    ) -> Result<PartToken> {
        let _guard = self.enter(Op::PutPart, Some(index as u64))?;
        self.observe(Op::PutPart, self.inner.put_part(session, index, data, digest))
    }

    fn complete_upload(
        &self,
        session: &UploadSessionToken,
        remote: &RemoteId,
        parts: &[PartToken],
        digest: &Digest,
    ) -> Result<()> {
        let _guard = self.enter(Op::Complete, None)?;
        self.completions
            .lock()
            .unwrap()
            .push(parts.iter().map(|p| p.index).collect());
        self.observe(Op::Complete, self.inner.complete_upload(session, remote, parts, digest))
    }

    fn abort_upload(&self, session: &UploadSessionToken, remote: &RemoteId) -> Result<()> {
        let _guard = self.enter(Op::Abort, None)?;
        self.observe(Op::Abort, self.inner.abort_upload(session, remote))
    }

    fn put_object(&self, remote: &RemoteId, data: &[u8], digest: &Digest) -> Result<()> {
        let _guard = self.enter(Op::PutObject, None)?;
        self.observe(Op::PutObject, self.inner.put_object(remote, data, digest))
    }

    fn get_object_metadata(&self, remote: &RemoteId) -> Result<ObjectMetadata> {
        let _guard = self.enter(Op::Metadata, None)?;
        let result = self.inner.get_object_metadata(remote).map(|meta| ObjectMetadata {
            digest: meta.digest.filter(|_| !self.strip_digest),
            ..meta
        });
        self.observe(Op::Metadata, result)
    }

    fn get_range(&self, remote: &RemoteId, range: ByteRange) -> Result<Vec<u8>> {
        let _guard = self.enter(Op::GetRange, Some(range.start))?;
        let result = self.inner.get_range(remote, range);
        if result.is_ok() {
            self.fetched.lock().unwrap().push(range);
        }
        self.observe(Op::GetRange, result)
    }
}

/// Configuration scaled down for tests: KiB-sized parts, millisecond backoff
pub fn test_config() -> TransferConfig {
    TransferConfig {
        max_concurrency: 4,
        min_part_size: 1024,
        max_part_size: 1024 * 1024,
        part_size: None,
        multipart_threshold: 8 * 1024,
        max_retry_attempts: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        max_completion_attempts: 2,
        ..Default::default()
    }
}

/// Deterministic, non-repeating test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + i / 251) % 256) as u8)
        .collect()
}

/// Open a store under `dir` and seed it with `remote = data`
pub fn seeded_store(dir: &Path, remote: &str, data: &[u8], config: &TransferConfig) -> LocalObjectStore {
    let store = LocalObjectStore::open(dir).unwrap();
    let digest = crate::hash::hash_bytes(data, config.hash_algorithm);
    store
        .put_object(&RemoteId::new(remote), data, &digest)
        .unwrap();
    store
}
