//! Transfer requests and per-transfer state
//!
//! `TransferState` owns the fixed part set of one transfer and enforces the
//! part lifecycle: `Pending -> InFlight -> {Complete | Failed}` and
//! `Failed -> Pending` when a retry is scheduled. `Complete` is final, so a
//! part can never be accepted twice.

use crate::chunk::ByteRange;
use crate::error::{Result, TransferError};
use crate::hash::Digest;
use crate::transport::{Direction, PartToken, RemoteId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Slice used for interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// One requested transfer; immutable once submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Upload or download
    pub direction: Direction,
    /// Local file
    pub local_path: PathBuf,
    /// Remote object
    pub remote: RemoteId,
    /// Expected size, when the caller knows it
    pub size: Option<u64>,
    /// Requested parallelism (capped by the session)
    pub concurrency: usize,
}

impl TransferRequest {
    /// Upload `local_path` to `remote`
    pub fn upload(local_path: impl Into<PathBuf>, remote: impl Into<RemoteId>) -> Self {
        Self {
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote: remote.into(),
            size: None,
            concurrency: usize::MAX,
        }
    }

    /// Download `remote` to `local_path`
    pub fn download(remote: impl Into<RemoteId>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            local_path: local_path.into(),
            remote: remote.into(),
            size: None,
            concurrency: usize::MAX,
        }
    }

    /// Request a specific parallelism
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Declare the expected size
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Local path
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }
}

/// Lifecycle of a part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Waiting for dispatch
    Pending,
    /// Being transferred by a worker
    InFlight,
    /// Accepted; final
    Complete,
    /// Last attempt failed
    Failed,
}

/// One part of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// 0-based index
    pub index: usize,
    /// Byte range within the payload
    pub range: ByteRange,
    /// Digest of the part bytes, once read
    pub digest: Option<Digest>,
    /// Remote receipt, for uploads
    pub token: Option<PartToken>,
    /// Current status
    pub status: PartStatus,
    /// Failed attempts so far
    pub attempts: u32,
}

/// Mutable state of one transfer
#[derive(Debug)]
pub struct TransferState {
    request: TransferRequest,
    parts: Mutex<Vec<Part>>,
    bytes_transferred: AtomicU64,
    started: Instant,
}

impl TransferState {
    /// Create state with one pending part per range
    pub fn new(request: TransferRequest, ranges: &[ByteRange]) -> Self {
        let parts = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| Part {
                index,
                range: *range,
                digest: None,
                token: None,
                status: PartStatus::Pending,
                attempts: 0,
            })
            .collect();

        Self {
            request,
            parts: Mutex::new(parts),
            bytes_transferred: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Part>> {
        self.parts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The request this state belongs to
    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    /// Number of parts
    pub fn part_count(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of one part
    pub fn part(&self, index: usize) -> Option<Part> {
        self.lock().get(index).cloned()
    }

    /// Mark a part complete without transferring it (already durable on resume)
    pub fn mark_resumed(&self, index: usize) -> Result<()> {
        let mut parts = self.lock();
        let part = part_mut(&mut parts, index)?;
        if part.status != PartStatus::Pending {
            return Err(invalid_transition(index, part.status, PartStatus::Complete));
        }
        part.status = PartStatus::Complete;
        Ok(())
    }

    /// `Pending -> InFlight`; returns the part's range
    pub fn begin(&self, index: usize) -> Result<ByteRange> {
        let mut parts = self.lock();
        let part = part_mut(&mut parts, index)?;
        if part.status != PartStatus::Pending {
            return Err(invalid_transition(index, part.status, PartStatus::InFlight));
        }
        part.status = PartStatus::InFlight;
        Ok(part.range)
    }

    /// `InFlight -> Complete`
    pub fn complete(
        &self,
        index: usize,
        digest: Option<Digest>,
        token: Option<PartToken>,
    ) -> Result<()> {
        let mut parts = self.lock();
        let part = part_mut(&mut parts, index)?;
        if part.status != PartStatus::InFlight {
            return Err(invalid_transition(index, part.status, PartStatus::Complete));
        }
        part.status = PartStatus::Complete;
        part.digest = digest;
        part.token = token;
        self.bytes_transferred
            .fetch_add(part.range.len(), Ordering::Relaxed);
        Ok(())
    }

    /// `InFlight -> Failed`; returns the failed-attempt count
    pub fn fail(&self, index: usize) -> Result<u32> {
        let mut parts = self.lock();
        let part = part_mut(&mut parts, index)?;
        if part.status != PartStatus::InFlight {
            return Err(invalid_transition(index, part.status, PartStatus::Failed));
        }
        part.status = PartStatus::Failed;
        part.attempts += 1;
        Ok(part.attempts)
    }

    /// `Failed -> Pending`
    pub fn retry(&self, index: usize) -> Result<()> {
        let mut parts = self.lock();
        let part = part_mut(&mut parts, index)?;
        if part.status != PartStatus::Failed {
            return Err(invalid_transition(index, part.status, PartStatus::Pending));
        }
        part.status = PartStatus::Pending;
        Ok(())
    }

    /// Indices of parts waiting for dispatch
    pub fn pending_indices(&self) -> Vec<usize> {
        self.lock()
            .iter()
            .filter(|p| p.status == PartStatus::Pending)
            .map(|p| p.index)
            .collect()
    }

    /// Number of complete parts
    pub fn completed_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|p| p.status == PartStatus::Complete)
            .count()
    }

    /// Whether every part is complete
    pub fn is_complete(&self) -> bool {
        self.lock().iter().all(|p| p.status == PartStatus::Complete)
    }

    /// Part tokens in index order, if every part has one
    pub fn tokens_in_order(&self) -> Option<Vec<PartToken>> {
        self.lock().iter().map(|p| p.token.clone()).collect()
    }

    /// Bytes moved in this run (resumed parts excluded)
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Total failed attempts across all parts
    pub fn total_attempts(&self) -> u32 {
        self.lock().iter().map(|p| p.attempts).sum()
    }

    /// Time since the state was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn part_mut(parts: &mut [Part], index: usize) -> Result<&mut Part> {
    let len = parts.len();
    parts
        .get_mut(index)
        .ok_or_else(|| TransferError::precondition(format!("part {index} out of range ({len} parts)")))
}

fn invalid_transition(index: usize, from: PartStatus, to: PartStatus) -> TransferError {
    TransferError::precondition(format!("part {index}: invalid transition {from:?} -> {to:?}"))
}

/// Cooperative cancellation flag shared by a transfer's workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `false` if the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(parts: u64) -> TransferState {
        let ranges: Vec<ByteRange> = (0..parts).map(|i| ByteRange::new(i * 10, i * 10 + 10)).collect();
        TransferState::new(TransferRequest::upload("/tmp/x", "x"), &ranges)
    }

    fn token(index: usize) -> PartToken {
        PartToken {
            index,
            etag: format!("etag-{index}"),
        }
    }

    #[test]
    fn test_happy_path() {
        let state = state(2);
        assert_eq!(state.pending_indices(), vec![0, 1]);

        assert_eq!(state.begin(1).unwrap(), ByteRange::new(10, 20));
        state.complete(1, None, Some(token(1))).unwrap();
        assert_eq!(state.tokens_in_order(), None);

        state.begin(0).unwrap();
        state.complete(0, None, Some(token(0))).unwrap();
        assert!(state.is_complete());
        assert_eq!(state.bytes_transferred(), 20);

        let indices: Vec<usize> = state.tokens_in_order().unwrap().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_complete_is_final() {
        let state = state(1);
        state.begin(0).unwrap();
        state.complete(0, None, None).unwrap();

        assert!(state.begin(0).is_err());
        assert!(state.complete(0, None, None).is_err());
        assert!(state.fail(0).is_err());
        assert_eq!(state.bytes_transferred(), 10);
    }

    #[test]
    fn test_retry_cycle_counts_attempts() {
        let state = state(1);
        for expected in 1..=3 {
            state.begin(0).unwrap();
            assert_eq!(state.fail(0).unwrap(), expected);
            state.retry(0).unwrap();
        }
        assert_eq!(state.part(0).unwrap().status, PartStatus::Pending);
        assert_eq!(state.total_attempts(), 3);
    }

    #[test]
    fn test_resumed_parts_do_not_count_bytes() {
        let state = state(3);
        state.mark_resumed(0).unwrap();
        state.mark_resumed(2).unwrap();
        assert_eq!(state.pending_indices(), vec![1]);
        assert_eq!(state.completed_count(), 2);
        assert_eq!(state.bytes_transferred(), 0);
        assert!(state.mark_resumed(0).is_err());
    }

    #[test]
    fn test_out_of_range() {
        assert!(state(1).begin(5).is_err());
    }

    #[test]
    fn test_cancellable_sleep() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(10)));

        let clone = token.clone();
        clone.cancel();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
