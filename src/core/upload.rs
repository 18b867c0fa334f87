//! Upload coordinator
//!
//! Small files go up in one `put_object` call. Larger files are split by the
//! part planner and driven through a multipart session:
//!
//! 1. `open_upload` (retried per policy)
//! 2. parts read at their offsets, hashed and sent by the worker pool
//! 3. the completion transaction lists tokens in index order
//!
//! Any failure or cancellation after the session is opened aborts it. If the
//! abort itself fails, that is logged and attached to the original error.

use crate::chunk::PartPlan;
use crate::core::dispatch::{
    failure_reason, CoordinatorOutcome, PartDone, PartsOutcome, TransferContext, TransferSummary,
};
use crate::core::state::{TransferRequest, TransferState};
use crate::error::{IoResultExt, ReasonCode, Result, TransferError};
use crate::fs::read_exact_at;
use crate::hash::{hash_bytes, Digest};
use crate::progress::TransferEvent;
use crate::transport::{Direction, TransportHandle, UploadSessionToken};
use std::fs::File;

/// Drives one upload over a selected transport
pub struct UploadCoordinator<'a> {
    ctx: TransferContext<'a>,
    transport: &'a TransportHandle,
}

impl<'a> UploadCoordinator<'a> {
    /// Bind a coordinator to one transfer context and transport
    pub fn new(ctx: TransferContext<'a>, transport: &'a TransportHandle) -> Self {
        Self { ctx, transport }
    }

    /// Upload `request.local_path`, whose whole-file digest is `digest`
    pub fn run(&self, request: &TransferRequest, size: u64, digest: &Digest) -> Result<CoordinatorOutcome> {
        if size == 0 {
            return Err(TransferError::precondition(format!(
                "refusing to upload empty file {}",
                request.local_path.display()
            )));
        }

        if size < self.ctx.config.multipart_threshold {
            self.single_shot(request, size, digest)
        } else {
            self.multipart(request, size, digest)
        }
    }

    fn single_shot(&self, request: &TransferRequest, size: u64, digest: &Digest) -> Result<CoordinatorOutcome> {
        let remote = &request.remote;
        let path = request.local_path();

        let data = std::fs::read(path).with_path(path)?;
        if data.len() as u64 != size {
            return Err(TransferError::precondition(format!(
                "{} changed size during upload ({} -> {} bytes)",
                path.display(),
                size,
                data.len()
            )));
        }

        self.ctx.events.emit(TransferEvent::Started {
            remote: remote.clone(),
            direction: Direction::Upload,
            transport: self.transport.kind,
            total_bytes: size,
            parts: 1,
        });

        if !self.ctx.throttle(size) {
            return Ok(CoordinatorOutcome::Cancelled);
        }

        tracing::debug!("Single-shot upload of {} ({} bytes)", remote, size);
        let sent = self.ctx.retry_call(remote, "put_object", true, || {
            self.transport.transport.put_object(remote, &data, digest)
        })?;
        if sent.is_none() {
            return Ok(CoordinatorOutcome::Cancelled);
        }

        self.ctx.events.emit(TransferEvent::PartCompleted {
            remote: remote.clone(),
            index: 0,
            bytes: size,
        });

        Ok(CoordinatorOutcome::Completed(TransferSummary {
            size,
            digest: digest.clone(),
            parts: 1,
            bytes_transferred: size,
            resumed_bytes: 0,
        }))
    }

    fn multipart(&self, request: &TransferRequest, size: u64, digest: &Digest) -> Result<CoordinatorOutcome> {
        let remote = &request.remote;
        let path = request.local_path();
        let transport = &self.transport.transport;

        let concurrency = request.concurrency.min(self.ctx.config.max_concurrency);
        let plan = PartPlan::for_transfer(size, concurrency, self.ctx.config)?;
        let state = TransferState::new(request.clone(), &plan.ranges);
        let workers = self.ctx.worker_count(request.concurrency, plan.len());
        let file = File::open(path).with_path(path)?;

        let Some(session) = self
            .ctx
            .retry_call(remote, "open_upload", true, || transport.open_upload(remote))?
        else {
            return Ok(CoordinatorOutcome::Cancelled);
        };

        tracing::info!(
            "Uploading {} to {}: {} parts of {} bytes, {} workers, {} transport",
            path.display(),
            remote,
            plan.len(),
            plan.part_size,
            workers,
            self.transport.kind
        );
        self.ctx.events.emit(TransferEvent::Started {
            remote: remote.clone(),
            direction: Direction::Upload,
            transport: self.transport.kind,
            total_bytes: size,
            parts: plan.len(),
        });

        let algorithm = self.ctx.config.hash_algorithm;
        let outcome = self.ctx.run_parts(&state, workers, |index, range| {
            let mut buffer = vec![0u8; range.len() as usize];
            read_exact_at(&file, &mut buffer, range.start).with_path(path)?;
            let part_digest = hash_bytes(&buffer, algorithm);
            let token = transport.put_part(&session, index, &buffer, &part_digest)?;
            Ok(PartDone {
                digest: Some(part_digest),
                token: Some(token),
            })
        });

        match outcome {
            PartsOutcome::Completed => {}
            PartsOutcome::Cancelled => {
                tracing::info!("Upload of {} cancelled, aborting", remote);
                self.abort(&session, request);
                return Ok(CoordinatorOutcome::Cancelled);
            }
            PartsOutcome::Failed(err) => {
                let abort_error = self.abort(&session, request);
                return Err(err.with_abort_error(abort_error));
            }
        }

        match self.complete(&session, request, &state, digest) {
            Ok(true) => {}
            Ok(false) => {
                self.abort(&session, request);
                return Ok(CoordinatorOutcome::Cancelled);
            }
            Err(err) => {
                let abort_error = self.abort(&session, request);
                return Err(err.with_abort_error(abort_error));
            }
        }

        tracing::info!(
            "Uploaded {} ({} parts, {} failed attempts) in {:.1?}",
            remote,
            plan.len(),
            state.total_attempts(),
            state.elapsed()
        );

        Ok(CoordinatorOutcome::Completed(TransferSummary {
            size,
            digest: digest.clone(),
            parts: plan.len(),
            bytes_transferred: state.bytes_transferred(),
            resumed_bytes: 0,
        }))
    }

    /// Commit the upload; `Ok(false)` if cancelled between attempts
    fn complete(
        &self,
        session: &UploadSessionToken,
        request: &TransferRequest,
        state: &TransferState,
        digest: &Digest,
    ) -> Result<bool> {
        let remote = &request.remote;
        let tokens = state.tokens_in_order().ok_or_else(|| {
            TransferError::precondition("completed parts are missing upload tokens")
                .into_transfer_failed(remote.as_str(), ReasonCode::Terminal)
        })?;

        let max_attempts = self.ctx.config.max_completion_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(false);
            }

            let result = {
                let Some(_permit) = self.ctx.limiter.acquire_cancellable(self.ctx.cancel) else {
                    return Ok(false);
                };
                self.transport
                    .transport
                    .complete_upload(session, remote, &tokens, digest)
            };
            let err = match result {
                Ok(()) => return Ok(true),
                Err(e) => e,
            };

            if err.is_credential_rejection() || attempt >= max_attempts {
                let reason = if err.is_credential_rejection() {
                    ReasonCode::CredentialRejected
                } else {
                    ReasonCode::CompletionFailed
                };
                tracing::warn!(
                    "Completion of {} failed after {} attempts: {}",
                    remote,
                    attempt,
                    err
                );
                return Err(err.into_transfer_failed(remote.as_str(), reason));
            }

            let decision = self.ctx.policy.decide(attempt, &err.classify());
            let wait = if decision.retryable {
                decision.wait
            } else {
                self.ctx.policy.backoff(attempt)
            };
            tracing::warn!(
                "Completion of {} failed (attempt {}/{}, {}): {}. Retrying in {:?}",
                remote,
                attempt,
                max_attempts,
                failure_reason(&err, decision.reason),
                err,
                wait
            );
            if !self.ctx.cancel.sleep(wait) {
                return Ok(false);
            }
            attempt += 1;
        }
    }

    /// Abort the session; returns the abort failure, if any
    fn abort(&self, session: &UploadSessionToken, request: &TransferRequest) -> Option<String> {
        let _permit = self.ctx.limiter.acquire();
        match self
            .transport
            .transport
            .abort_upload(session, &request.remote)
        {
            Ok(()) => {
                tracing::debug!("Aborted upload session {} for {}", session, request.remote);
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to abort upload session {} for {}: {}",
                    session,
                    request.remote,
                    e
                );
                Some(e.to_string())
            }
        }
    }
}
