//! Part dispatch shared by the upload and download coordinators
//!
//! Part indices are queued on a crossbeam channel and pulled by a fixed set
//! of scoped worker threads. Every dispatch holds one permit from the
//! session-wide [`ConcurrencyLimiter`]; backoff waits happen after the permit
//! is released and are cut short by cancellation.

use crate::chunk::ByteRange;
use crate::config::TransferConfig;
use crate::core::pool::ConcurrencyLimiter;
use crate::core::state::{CancellationToken, TransferState};
use crate::error::{ReasonCode, Result, TransferError};
use crate::fs::BandwidthLimiter;
use crate::hash::Digest;
use crate::progress::{EventSink, TransferEvent};
use crate::retry::RetryPolicy;
use crate::transport::{PartToken, RemoteId};
use crossbeam::channel::{unbounded, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// How long an idle worker waits for a part before re-checking for exit
const WORKER_POLL: Duration = Duration::from_millis(50);

/// Everything a coordinator borrows from its session for one transfer
#[derive(Clone, Copy)]
pub struct TransferContext<'a> {
    /// Validated configuration
    pub config: &'a TransferConfig,
    /// Session-wide worker budget
    pub limiter: &'a ConcurrencyLimiter,
    /// Retry policy
    pub policy: &'a RetryPolicy,
    /// Progress events
    pub events: &'a EventSink,
    /// Optional bandwidth limit
    pub throttle: Option<&'a BandwidthLimiter>,
    /// Cancellation for this transfer
    pub cancel: &'a CancellationToken,
}

/// What a successful part operation produced
#[derive(Debug, Default)]
pub struct PartDone {
    /// Digest of the part bytes
    pub digest: Option<Digest>,
    /// Upload receipt
    pub token: Option<PartToken>,
}

/// How a dispatch run ended
#[derive(Debug)]
pub enum PartsOutcome {
    /// Every part is complete
    Completed,
    /// Cancellation was observed before all parts completed
    Cancelled,
    /// A part failed terminally or ran out of retries
    Failed(TransferError),
}

/// Result of a coordinator run that moved (or resumed) every byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Payload size
    pub size: u64,
    /// Whole-object digest
    pub digest: Digest,
    /// Number of parts or ranges
    pub parts: usize,
    /// Bytes moved in this run
    pub bytes_transferred: u64,
    /// Bytes already durable from an earlier run
    pub resumed_bytes: u64,
}

/// How a coordinator run ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    /// All bytes transferred and, for downloads, verified
    Completed(TransferSummary),
    /// Stopped cooperatively; cleanup already ran
    Cancelled,
}

impl<'a> TransferContext<'a> {
    /// Number of workers for a transfer with `parts` parts
    pub fn worker_count(&self, requested: usize, parts: usize) -> usize {
        requested
            .min(self.config.max_concurrency)
            .min(parts)
            .max(1)
    }

    /// Wait for bandwidth; `false` if cancelled while waiting
    pub fn throttle(&self, bytes: u64) -> bool {
        match self.throttle {
            Some(limiter) => limiter.wait_for_capacity(bytes, self.cancel),
            None => !self.cancel.is_cancelled(),
        }
    }

    /// Run a single remote call under the retry policy
    ///
    /// Returns `Ok(None)` if cancelled. With `use_permit` every attempt holds
    /// a limiter permit for the duration of the call.
    pub fn retry_call<T>(
        &self,
        remote: &RemoteId,
        what: &str,
        use_permit: bool,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<Option<T>> {
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let result = if use_permit {
                let Some(_permit) = self.limiter.acquire_cancellable(self.cancel) else {
                    return Ok(None);
                };
                op()
            } else {
                op()
            };

            let err = match result {
                Ok(value) => return Ok(Some(value)),
                Err(e) => e,
            };

            failures += 1;
            let decision = self.policy.decide(failures, &err.classify());
            if !decision.retryable {
                let reason = failure_reason(&err, decision.reason);
                tracing::debug!("{} for {} gave up after {} failures: {}", what, remote, failures, err);
                return Err(err.into_transfer_failed(remote.as_str(), reason));
            }

            tracing::warn!(
                "{} for {} failed (attempt {}/{}): {}. Retrying in {:?}",
                what,
                remote,
                failures,
                self.policy.max_retries + 1,
                err,
                decision.wait
            );
            if !self.cancel.sleep(decision.wait) {
                return Ok(None);
            }
        }
    }

    /// Drive every pending part of `state` through `op` on `workers` threads
    pub fn run_parts<F>(&self, state: &TransferState, workers: usize, op: F) -> PartsOutcome
    where
        F: Fn(usize, ByteRange) -> Result<PartDone> + Sync,
    {
        let remote = &state.request().remote;
        let pending = state.pending_indices();
        if pending.is_empty() {
            return PartsOutcome::Completed;
        }

        let (part_tx, part_rx) = unbounded::<usize>();
        for index in &pending {
            let _ = part_tx.send(*index);
        }

        let outstanding = AtomicUsize::new(pending.len());
        let stop = AtomicBool::new(false);
        let failure: Mutex<Option<TransferError>> = Mutex::new(None);

        let fail = |err: TransferError| {
            stop.store(true, Ordering::SeqCst);
            let mut slot = failure.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let part_tx = &part_tx;
                let part_rx = &part_rx;
                let outstanding = &outstanding;
                let stop = &stop;
                let fail = &fail;
                let op = &op;

                scope.spawn(move || {
                    loop {
                        if stop.load(Ordering::SeqCst)
                            || self.cancel.is_cancelled()
                            || outstanding.load(Ordering::SeqCst) == 0
                        {
                            break;
                        }

                        let index = match part_rx.recv_timeout(WORKER_POLL) {
                            Ok(index) => index,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        };

                        let Some(permit) = self.limiter.acquire_cancellable(self.cancel) else {
                            break;
                        };
                        let range = match state.begin(index) {
                            Ok(range) => range,
                            Err(e) => {
                                fail(e.into_transfer_failed(remote.as_str(), ReasonCode::Terminal));
                                break;
                            }
                        };
                        if !self.throttle(range.len()) {
                            break;
                        }
                        let result = op(index, range);
                        drop(permit);

                        match result {
                            Ok(done) => {
                                if let Err(e) = state.complete(index, done.digest, done.token) {
                                    fail(e.into_transfer_failed(remote.as_str(), ReasonCode::Terminal));
                                    break;
                                }
                                outstanding.fetch_sub(1, Ordering::SeqCst);
                                self.events.emit(TransferEvent::PartCompleted {
                                    remote: remote.clone(),
                                    index,
                                    bytes: range.len(),
                                });
                            }
                            Err(err) => {
                                if self.cancel.is_cancelled() {
                                    tracing::debug!("Part {} of {} interrupted by cancellation: {}", index, remote, err);
                                    break;
                                }
                                let attempts = match state.fail(index) {
                                    Ok(attempts) => attempts,
                                    Err(e) => {
                                        fail(e.into_transfer_failed(remote.as_str(), ReasonCode::Terminal));
                                        break;
                                    }
                                };

                                let decision = self.policy.decide(attempts, &err.classify());
                                if !decision.retryable {
                                    tracing::debug!(
                                        "Part {} of {} failed after {} attempts: {}",
                                        index,
                                        remote,
                                        attempts,
                                        err
                                    );
                                    let reason = failure_reason(&err, decision.reason);
                                    fail(err.into_transfer_failed(remote.as_str(), reason));
                                    break;
                                }

                                tracing::warn!(
                                    "Part {} of {} failed (attempt {}): {}. Retrying in {:?}",
                                    index,
                                    remote,
                                    attempts,
                                    err,
                                    decision.wait
                                );
                                self.events.emit(TransferEvent::PartRetry {
                                    remote: remote.clone(),
                                    index,
                                    attempt: attempts,
                                    wait: decision.wait,
                                    reason: decision.reason,
                                });

                                if !self.cancel.sleep(decision.wait) {
                                    break;
                                }
                                if let Err(e) = state.retry(index) {
                                    fail(e.into_transfer_failed(remote.as_str(), ReasonCode::Terminal));
                                    break;
                                }
                                let _ = part_tx.send(index);
                            }
                        }
                    }

                    tracing::trace!("Worker {} for {} shutting down", worker_id, remote);
                });
            }
        });

        if let Some(err) = failure.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return PartsOutcome::Failed(err);
        }
        if state.is_complete() {
            return PartsOutcome::Completed;
        }
        if self.cancel.is_cancelled() {
            return PartsOutcome::Cancelled;
        }

        PartsOutcome::Failed(
            TransferError::precondition(format!(
                "{} of {} parts left incomplete",
                state.part_count() - state.completed_count(),
                state.part_count()
            ))
            .into_transfer_failed(remote.as_str(), ReasonCode::Terminal),
        )
    }
}

/// Reason to report when the policy gives up on `err`
pub fn failure_reason(err: &TransferError, decided: ReasonCode) -> ReasonCode {
    if decided == ReasonCode::Terminal {
        err.reason()
    } else {
        decided
    }
}
