//! Download coordinator
//!
//! Ranges are written at their final offsets into `<dest>.partial`, which is
//! pre-allocated to the object size, and each durable range is recorded in
//! the `<dest>.partial.json` sidecar. A later run with a matching sidecar
//! fetches only the ranges not recorded there.
//!
//! Failure and cancellation leave both files in place for the next attempt.
//! On resume each recorded range is re-hashed from the staging file and
//! fetched again if its bytes no longer match. Once every range is written
//! the whole file is verified against the remote digest, when the remote has
//! one, before it is renamed onto the destination.

use crate::chunk::{ByteRange, PartPlan};
use crate::config::MismatchPolicy;
use crate::core::dispatch::{CoordinatorOutcome, PartDone, PartsOutcome, TransferContext, TransferSummary};
use crate::core::state::{TransferRequest, TransferState};
use crate::error::{IoResultExt, ReasonCode, Result, TransferError};
use crate::fs::write_all_at;
use crate::hash::{hash_bytes, hash_file, hash_file_range, verify_file, Digest};
use crate::progress::TransferEvent;
use crate::sync::{sidecar_path, staging_path, Sidecar};
use crate::transport::{Direction, ObjectMetadata, RemoteId, TransportHandle};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

/// Drives one download over a selected transport
pub struct DownloadCoordinator<'a> {
    ctx: TransferContext<'a>,
    transport: &'a TransportHandle,
}

impl<'a> DownloadCoordinator<'a> {
    /// Bind a coordinator to one transfer context and transport
    pub fn new(ctx: TransferContext<'a>, transport: &'a TransportHandle) -> Self {
        Self { ctx, transport }
    }

    /// Fetch size and digest of the remote object; `None` if cancelled
    pub fn metadata(&self, remote: &RemoteId) -> Result<Option<ObjectMetadata>> {
        let transport = &self.transport.transport;
        self.ctx
            .retry_call(remote, "get_object_metadata", true, || transport.get_object_metadata(remote))
    }

    /// Download `request.remote` into `request.local_path`
    pub fn run(&self, request: &TransferRequest, meta: &ObjectMetadata) -> Result<CoordinatorOutcome> {
        let remote = &request.remote;
        let destination = request.local_path();

        if meta.size == 0 {
            return Err(TransferError::precondition(format!(
                "remote object '{}' is empty",
                remote
            )));
        }
        if let Some(expected) = request.size {
            if expected != meta.size {
                return Err(TransferError::precondition(format!(
                    "remote object '{}' is {} bytes, request expected {}",
                    remote, meta.size, expected
                )));
            }
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }

        let staging = staging_path(destination);
        let concurrency = request.concurrency.min(self.ctx.config.max_concurrency);
        let (mut sidecar, plan) = self.prepare(remote, meta, &staging, concurrency)?;

        let state = TransferState::new(request.clone(), &plan.ranges);
        let mut resumed_bytes = 0u64;
        let mut resumed_parts = 0usize;
        for (index, range) in plan.ranges.iter().enumerate() {
            if self.still_durable(&sidecar, &staging, range) {
                state.mark_resumed(index)?;
                resumed_bytes += range.len();
                resumed_parts += 1;
            } else if sidecar.is_completed(range) {
                tracing::warn!("Range {} of {} changed on disk, fetching it again", range, remote);
                sidecar.forget_range(range)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&staging)
            .with_path(&staging)?;
        file.set_len(meta.size).with_path(&staging)?;

        let workers = self.ctx.worker_count(request.concurrency, state.pending_indices().len());
        tracing::info!(
            "Downloading {} to {}: {} ranges of {} bytes ({} already durable), {} workers, {} transport",
            remote,
            destination.display(),
            plan.len(),
            plan.part_size,
            resumed_parts,
            workers,
            self.transport.kind
        );
        self.ctx.events.emit(TransferEvent::Started {
            remote: remote.clone(),
            direction: Direction::Download,
            transport: self.transport.kind,
            total_bytes: meta.size,
            parts: plan.len(),
        });
        if resumed_parts > 0 {
            self.ctx.events.emit(TransferEvent::Resumed {
                remote: remote.clone(),
                bytes: resumed_bytes,
                parts: resumed_parts,
            });
        }

        let sidecar = Mutex::new(sidecar);
        let outcome = self.ctx.run_parts(&state, workers, |_, range| {
            self.fetch_range(remote, range, &file, &staging, &sidecar)
        });
        drop(file);
        let sidecar = sidecar.into_inner().unwrap_or_else(|e| e.into_inner());

        match outcome {
            PartsOutcome::Completed => {}
            PartsOutcome::Cancelled => {
                tracing::info!(
                    "Download of {} cancelled; {} of {} ranges kept for resume",
                    remote,
                    state.completed_count(),
                    plan.len()
                );
                return Ok(CoordinatorOutcome::Cancelled);
            }
            PartsOutcome::Failed(err) => {
                tracing::warn!(
                    "Download of {} failed; partial file {} kept for resume",
                    remote,
                    staging.display()
                );
                return Err(err);
            }
        }

        let digest = self.verify(remote, &staging, meta.digest.as_ref(), sidecar)?;
        std::fs::rename(&staging, destination).with_path(destination)?;

        tracing::info!(
            "Downloaded {} ({} bytes, {} resumed) in {:.1?}",
            remote,
            meta.size,
            resumed_bytes,
            state.elapsed()
        );

        Ok(CoordinatorOutcome::Completed(TransferSummary {
            size: meta.size,
            digest,
            parts: plan.len(),
            bytes_transferred: state.bytes_transferred(),
            resumed_bytes,
        }))
    }

    /// Load a matching sidecar or start over with a fresh one
    fn prepare(
        &self,
        remote: &RemoteId,
        meta: &ObjectMetadata,
        staging: &Path,
        concurrency: usize,
    ) -> Result<(Sidecar, PartPlan)> {
        let sidecar_file = sidecar_path(staging);

        if let Some(existing) = Sidecar::load(&sidecar_file)? {
            let staged_len = std::fs::metadata(staging).map(|m| m.len()).ok();
            if existing.matches(remote, meta.size, meta.digest.as_ref()) && staged_len == Some(meta.size) {
                match PartPlan::with_part_size(meta.size, existing.part_size) {
                    Ok(plan) => {
                        tracing::debug!(
                            "Resuming {} from {} ({} bytes durable)",
                            remote,
                            sidecar_file.display(),
                            existing.completed_bytes()
                        );
                        return Ok((existing, plan));
                    }
                    Err(e) => tracing::warn!("Discarding unusable sidecar for {}: {}", remote, e),
                }
            } else {
                tracing::info!(
                    "Discarding stale sidecar {} (object or partial file changed)",
                    sidecar_file.display()
                );
            }
        }

        Sidecar::remove(&sidecar_file)?;
        remove_if_exists(staging)?;

        let plan = PartPlan::for_transfer(meta.size, concurrency, self.ctx.config)?;
        let sidecar = Sidecar::create(
            &sidecar_file,
            remote.clone(),
            meta.size,
            meta.digest.clone(),
            plan.part_size,
        )?;
        Ok((sidecar, plan))
    }

    /// Whether a recorded range still hashes to the digest written with it
    fn still_durable(&self, sidecar: &Sidecar, staging: &Path, range: &ByteRange) -> bool {
        let Some(recorded) = sidecar.range_digest(range) else {
            return false;
        };
        match hash_file_range(staging, *range, recorded.algorithm) {
            Ok(actual) => &actual == recorded,
            Err(e) => {
                tracing::debug!("Cannot re-read range {} of {}: {}", range, staging.display(), e);
                false
            }
        }
    }

    fn fetch_range(
        &self,
        remote: &RemoteId,
        range: ByteRange,
        file: &File,
        staging: &Path,
        sidecar: &Mutex<Sidecar>,
    ) -> Result<PartDone> {
        let data = self.transport.transport.get_range(remote, range)?;
        if data.len() as u64 != range.len() {
            return Err(TransferError::Network(format!(
                "short read for {} range {}: got {} bytes",
                remote,
                range,
                data.len()
            )));
        }

        write_all_at(file, &data, range.start).with_path(staging)?;
        file.sync_data().with_path(staging)?;
        let digest = hash_bytes(&data, self.ctx.config.hash_algorithm);

        sidecar
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_range(range, digest.clone())?;

        Ok(PartDone {
            digest: Some(digest),
            token: None,
        })
    }

    /// Whole-file check with one extra pass on mismatch; returns the
    /// digest the finished file is known by
    fn verify(
        &self,
        remote: &RemoteId,
        staging: &Path,
        expected: Option<&Digest>,
        sidecar: Sidecar,
    ) -> Result<Digest> {
        let Some(expected) = expected else {
            let local = hash_file(staging, self.ctx.config.hash_algorithm)?;
            tracing::info!(
                "{} has no remote digest, keeping local digest {}",
                remote,
                local.short()
            );
            sidecar.discard()?;
            return Ok(local);
        };

        let mismatch = match verify_file(staging, expected)? {
            None => None,
            Some(first) => {
                tracing::warn!(
                    "Digest mismatch for {} (expected {}, got {}); verifying again",
                    remote,
                    expected.short(),
                    first.short()
                );
                verify_file(staging, expected)?
            }
        };

        let Some(actual) = mismatch else {
            sidecar.discard()?;
            return Ok(expected.clone());
        };

        sidecar.discard()?;
        match self.ctx.config.mismatch_policy {
            MismatchPolicy::DeletePartial => {
                remove_if_exists(staging)?;
                tracing::warn!("Deleted mismatched download {}", staging.display());
            }
            MismatchPolicy::RetainPartial => {
                tracing::warn!(
                    "Retaining mismatched download at {}; it must not be used",
                    staging.display()
                );
            }
        }

        Err(
            TransferError::checksum_mismatch(staging, expected.clone(), actual)
                .into_transfer_failed(remote.as_str(), ReasonCode::ChecksumMismatch),
        )
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransferError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::core::pool::ConcurrencyLimiter;
    use crate::core::state::CancellationToken;
    use crate::core::test_support::{payload, seeded_store, test_config, Fault, InstrumentedTransport, Op};
    use crate::hash::{hash_bytes, hash_file};
    use crate::progress::EventSink;
    use crate::retry::RetryPolicy;
    use crate::transport::{LocalObjectStore, Transport, TransportKind};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const REMOTE: &str = "datasets/blob.bin";

    struct Harness {
        dir: TempDir,
        store: LocalObjectStore,
        config: TransferConfig,
        limiter: ConcurrencyLimiter,
        policy: RetryPolicy,
        events: EventSink,
    }

    impl Harness {
        fn new(config: TransferConfig, data: &[u8]) -> Self {
            let dir = tempdir().unwrap();
            let store = seeded_store(&dir.path().join("store"), REMOTE, data, &config);
            Self {
                limiter: ConcurrencyLimiter::new(config.max_concurrency),
                policy: RetryPolicy::from_config(&config),
                events: EventSink::disabled(),
                dir,
                store,
                config,
            }
        }

        fn destination(&self) -> PathBuf {
            self.dir.path().join("out").join("blob.bin")
        }

        fn transport(&self) -> Arc<InstrumentedTransport> {
            Arc::new(InstrumentedTransport::new(Arc::new(self.store.clone())))
        }

        fn run(
            &self,
            transport: &Arc<InstrumentedTransport>,
            cancel: &CancellationToken,
        ) -> Result<CoordinatorOutcome> {
            let handle = TransportHandle {
                kind: TransportKind::Managed,
                transport: transport.clone() as Arc<dyn Transport>,
            };
            let ctx = TransferContext {
                config: &self.config,
                limiter: &self.limiter,
                policy: &self.policy,
                events: &self.events,
                throttle: None,
                cancel,
            };
            let coordinator = DownloadCoordinator::new(ctx, &handle);
            let remote = RemoteId::new(REMOTE);
            let meta = coordinator.metadata(&remote)?.unwrap();
            let request = TransferRequest::download(REMOTE, self.destination());
            coordinator.run(&request, &meta)
        }
    }

    fn eight_ranges(concurrency: usize) -> TransferConfig {
        TransferConfig {
            max_concurrency: concurrency,
            part_size: Some(4 * 1024),
            ..test_config()
        }
    }

    #[test]
    fn test_download_matches_source() {
        let data = payload(32 * 1024);
        let harness = Harness::new(eight_ranges(4), &data);
        let transport = harness.transport();

        let outcome = harness.run(&transport, &CancellationToken::new()).unwrap();
        let CoordinatorOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };

        assert_eq!(summary.parts, 8);
        assert_eq!(summary.resumed_bytes, 0);
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
        assert!(!staging_path(&harness.destination()).exists());
        assert!(!sidecar_path(&staging_path(&harness.destination())).exists());
    }

    #[test]
    fn test_resume_fetches_only_missing_ranges() {
        let data = payload(32 * 1024);
        let harness = Harness::new(eight_ranges(1), &data);

        let cancel = CancellationToken::new();
        let first = harness.transport();
        first.cancel_after(Op::GetRange, 3, cancel.clone());
        assert_eq!(harness.run(&first, &cancel).unwrap(), CoordinatorOutcome::Cancelled);
        let done_first = first.fetched_ranges();
        assert_eq!(done_first.len(), 3);

        let staging = staging_path(&harness.destination());
        let sidecar = Sidecar::load(&sidecar_path(&staging)).unwrap().unwrap();
        assert_eq!(sidecar.completed.len(), 3);

        let second = harness.transport();
        let outcome = harness.run(&second, &CancellationToken::new()).unwrap();
        let CoordinatorOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };

        let refetched = second.fetched_ranges();
        assert_eq!(refetched.len(), 5);
        assert!(refetched.iter().all(|r| !done_first.contains(r)));
        assert_eq!(summary.resumed_bytes, 3 * 4 * 1024);
        assert_eq!(
            hash_file(&harness.destination(), harness.config.hash_algorithm).unwrap(),
            hash_bytes(&data, harness.config.hash_algorithm)
        );
    }

    #[test]
    fn test_resume_refetches_range_changed_on_disk() {
        let data = payload(32 * 1024);
        let harness = Harness::new(eight_ranges(1), &data);

        let cancel = CancellationToken::new();
        let first = harness.transport();
        first.cancel_after(Op::GetRange, 3, cancel.clone());
        assert_eq!(harness.run(&first, &cancel).unwrap(), CoordinatorOutcome::Cancelled);
        let done_first = first.fetched_ranges();

        // Flip a byte inside one recorded range between runs
        let staging = staging_path(&harness.destination());
        let damaged = done_first[1];
        let mut bytes = std::fs::read(&staging).unwrap();
        bytes[damaged.start as usize + 10] ^= 0xff;
        std::fs::write(&staging, bytes).unwrap();

        let second = harness.transport();
        let outcome = harness.run(&second, &CancellationToken::new()).unwrap();
        let CoordinatorOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };

        let refetched = second.fetched_ranges();
        assert_eq!(refetched.len(), 6);
        assert!(refetched.contains(&damaged));
        assert!(!refetched.contains(&done_first[0]));
        assert!(!refetched.contains(&done_first[2]));
        assert_eq!(summary.resumed_bytes, 2 * 4 * 1024);
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
    }

    #[test]
    fn test_download_without_remote_digest() {
        let data = payload(16 * 1024);
        let harness = Harness::new(eight_ranges(2), &data);
        let transport = Arc::new(InstrumentedTransport::new(Arc::new(harness.store.clone())).without_digest());

        let outcome = harness.run(&transport, &CancellationToken::new()).unwrap();
        let CoordinatorOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };

        assert_eq!(summary.digest, hash_bytes(&data, harness.config.hash_algorithm));
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
        let staging = staging_path(&harness.destination());
        assert!(!staging.exists());
        assert!(!sidecar_path(&staging).exists());
    }

    #[test]
    fn test_metadata_retries_server_errors() {
        let data = payload(16 * 1024);
        let harness = Harness::new(eight_ranges(2), &data);
        let transport = harness.transport();
        transport.inject(Op::Metadata, None, 2, Fault::Server(503));

        let outcome = harness.run(&transport, &CancellationToken::new()).unwrap();
        assert!(matches!(outcome, CoordinatorOutcome::Completed(_)));
        assert_eq!(transport.calls(Op::Metadata), 3);
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
    }

    #[test]
    fn test_exhausted_range_keeps_partial_state() {
        let data = payload(32 * 1024);
        let harness = Harness::new(eight_ranges(2), &data);
        let transport = harness.transport();
        transport.inject(Op::GetRange, Some(8 * 1024), 4, Fault::Network);

        let err = harness.run(&transport, &CancellationToken::new()).unwrap_err();
        assert_eq!(err.reason(), ReasonCode::AttemptsExhausted);

        let staging = staging_path(&harness.destination());
        assert!(staging.exists());
        assert!(sidecar_path(&staging).exists());
        assert!(!harness.destination().exists());

        // the failed range is fetched on the next run and nothing else repeats
        let retry = harness.transport();
        assert!(matches!(
            harness.run(&retry, &CancellationToken::new()).unwrap(),
            CoordinatorOutcome::Completed(_)
        ));
        assert!(retry.fetched_ranges().contains(&ByteRange::new(8 * 1024, 12 * 1024)));
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
    }

    #[test]
    fn test_stale_sidecar_discarded() {
        let data = payload(16 * 1024);
        let harness = Harness::new(eight_ranges(2), &data);

        let staging = staging_path(&harness.destination());
        std::fs::create_dir_all(staging.parent().unwrap()).unwrap();
        std::fs::write(&staging, vec![0u8; 16 * 1024]).unwrap();
        let other = hash_bytes(b"another version", harness.config.hash_algorithm);
        let mut stale =
            Sidecar::create(sidecar_path(&staging), RemoteId::new(REMOTE), 16 * 1024, Some(other), 4096)
                .unwrap();
        stale
            .record_range(ByteRange::new(0, 4096), hash_bytes(&[0u8; 4096], harness.config.hash_algorithm))
            .unwrap();

        let transport = harness.transport();
        harness.run(&transport, &CancellationToken::new()).unwrap();

        assert_eq!(transport.fetched_ranges().len(), 4);
        assert_eq!(std::fs::read(harness.destination()).unwrap(), data);
    }

    fn corrupt_store_object(harness: &Harness) {
        // Overwrite the stored bytes but keep the recorded digest
        let object = harness.store.root().join("objects").join(REMOTE);
        let mut bytes = std::fs::read(&object).unwrap();
        bytes[100] ^= 0xff;
        std::fs::write(&object, bytes).unwrap();
    }

    #[test]
    fn test_mismatch_deletes_partial_by_default() {
        let harness = Harness::new(eight_ranges(2), &payload(16 * 1024));
        corrupt_store_object(&harness);

        let err = harness
            .run(&harness.transport(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::ChecksumMismatch);
        let message = err.to_string();
        assert!(message.contains("expected"));
        assert!(message.contains("observed"));

        let staging = staging_path(&harness.destination());
        assert!(!staging.exists());
        assert!(!sidecar_path(&staging).exists());
        assert!(!harness.destination().exists());
    }

    #[test]
    fn test_mismatch_retains_partial_when_asked() {
        let config = TransferConfig {
            mismatch_policy: MismatchPolicy::RetainPartial,
            ..eight_ranges(2)
        };
        let harness = Harness::new(config, &payload(16 * 1024));
        corrupt_store_object(&harness);

        let err = harness
            .run(&harness.transport(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::ChecksumMismatch);

        let staging = staging_path(&harness.destination());
        assert!(staging.exists());
        assert!(!sidecar_path(&staging).exists());
        assert!(!harness.destination().exists());
    }

    #[test]
    fn test_empty_object_is_precondition() {
        let harness = Harness::new(eight_ranges(2), &payload(1024));
        let transport = harness.transport();
        let handle = TransportHandle {
            kind: TransportKind::Managed,
            transport: transport.clone() as Arc<dyn Transport>,
        };
        let cancel = CancellationToken::new();
        let ctx = TransferContext {
            config: &harness.config,
            limiter: &harness.limiter,
            policy: &harness.policy,
            events: &harness.events,
            throttle: None,
            cancel: &cancel,
        };
        let meta = ObjectMetadata {
            size: 0,
            digest: Some(hash_bytes(b"", harness.config.hash_algorithm)),
        };

        let err = DownloadCoordinator::new(ctx, &handle)
            .run(&TransferRequest::download(REMOTE, harness.destination()), &meta)
            .unwrap_err();
        assert_eq!(err.reason(), ReasonCode::Precondition);
        assert_eq!(transport.calls(Op::GetRange), 0);
        assert!(!staging_path(&harness.destination()).exists());
    }
}
