//! Progress reporter implementation
//!
//! Uses indicatif for progress bars driven by [`TransferEvent`]s:
//! - Transfer count progress
//! - Byte transfer progress
//! - Throughput and ETA display
//! - Retry notices on the status line

use crate::core::TransferStatus;
use crate::progress::events::TransferEvent;
use crossbeam::channel::Receiver;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Progress reporter for transfer sessions
pub struct ProgressReporter {
    /// Multi-progress container
    multi: MultiProgress,
    /// Main progress bar (bytes)
    bytes_bar: ProgressBar,
    /// Transfer count progress bar
    transfers_bar: ProgressBar,
    /// Current status message
    status: ProgressBar,
    /// Start time
    start_time: Instant,
    total_bytes: AtomicU64,
    bytes_done: AtomicU64,
    total_transfers: AtomicU64,
    transfers_done: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    /// Is progress enabled
    enabled: AtomicBool,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        // Status line
        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let transfers_bar = multi.add(ProgressBar::new(0));
        transfers_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} transfers")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        transfers_bar.set_prefix("Files");

        let bytes_bar = multi.add(ProgressBar::new(0));
        bytes_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bytes_bar.set_prefix("Data ");

        Self {
            multi,
            bytes_bar,
            transfers_bar,
            status,
            start_time: Instant::now(),
            total_bytes: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            total_transfers: AtomicU64::new(0),
            transfers_done: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Create a disabled progress reporter (for quiet mode)
    pub fn disabled() -> Self {
        let reporter = Self::new();
        reporter.enabled.store(false, Ordering::SeqCst);
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    /// Consume events until every sender is gone
    pub fn run(&self, events: Receiver<TransferEvent>) -> ProgressSummary {
        for event in events.iter() {
            self.handle(&event);
        }
        self.summary()
    }

    /// Apply one event
    pub fn handle(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Started {
                remote,
                direction,
                transport,
                total_bytes,
                parts,
            } => {
                self.total_transfers.fetch_add(1, Ordering::Relaxed);
                self.transfers_bar.inc_length(1);
                self.total_bytes.fetch_add(*total_bytes, Ordering::Relaxed);
                self.bytes_bar.inc_length(*total_bytes);
                self.set_status(&format!(
                    "{} {} via {} transport ({} parts)",
                    direction,
                    truncate(remote.as_str()),
                    transport,
                    parts
                ));
            }
            TransferEvent::Resumed { bytes, .. } | TransferEvent::PartCompleted { bytes, .. } => {
                self.bytes_done.fetch_add(*bytes, Ordering::Relaxed);
                self.bytes_bar.inc(*bytes);
            }
            TransferEvent::PartRetry {
                remote,
                index,
                attempt,
                wait,
                reason,
            } => {
                self.retries.fetch_add(1, Ordering::Relaxed);
                self.set_status(&format!(
                    "{} part {} retry {} in {} ({})",
                    truncate(remote.as_str()),
                    index,
                    attempt,
                    humantime::format_duration(*wait),
                    reason
                ));
            }
            TransferEvent::Finished { status, .. } => {
                if *status == TransferStatus::Skipped {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    // skipped transfers never emit Started
                    self.total_transfers.fetch_add(1, Ordering::Relaxed);
                    self.transfers_bar.inc_length(1);
                }
                self.transfers_done.fetch_add(1, Ordering::Relaxed);
                self.transfers_bar.inc(1);
            }
            TransferEvent::Failed { remote, reason } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.transfers_done.fetch_add(1, Ordering::Relaxed);
                self.transfers_bar.inc(1);
                self.set_status(&format!("{} failed: {}", truncate(remote.as_str()), reason));
            }
        }
    }

    /// Set current status message
    pub fn set_status(&self, msg: &str) {
        self.status.set_message(msg.to_string());
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get current throughput in bytes/second
    pub fn throughput(&self) -> f64 {
        let bytes = self.bytes_done.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Finish progress with success message
    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.transfers_bar.finish();
        self.bytes_bar.finish();
    }

    /// Finish progress with error message
    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.transfers_bar.abandon();
        self.bytes_bar.abandon();
    }

    /// Check if progress is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Get progress summary
    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            transfers: self.total_transfers.load(Ordering::Relaxed),
            transfers_done: self.transfers_done.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            throughput: self.throughput(),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() > 48 {
        let tail: String = chars[chars.len() - 45..].iter().collect();
        format!("...{}", tail)
    } else {
        name.to_string()
    }
}

/// Progress summary
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    /// Total bytes planned
    pub total_bytes: u64,
    /// Bytes moved or resumed
    pub bytes_done: u64,
    /// Transfers seen
    pub transfers: u64,
    /// Transfers finished (any outcome)
    pub transfers_done: u64,
    /// Transfers skipped by the cache
    pub skipped: u64,
    /// Transfers that failed
    pub failed: u64,
    /// Part retries
    pub retries: u64,
    /// Elapsed time
    pub elapsed: Duration,
    /// Throughput in bytes/second
    pub throughput: f64,
}

impl ProgressSummary {
    /// Get completion percentage
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Print summary to console
    pub fn print(&self) {
        println!("Transfers: {}/{} ({} skipped, {} failed)",
            self.transfers_done, self.transfers, self.skipped, self.failed);
        println!("Bytes:     {}/{}",
            humansize::format_size(self.bytes_done, humansize::BINARY),
            humansize::format_size(self.total_bytes, humansize::BINARY)
        );
        println!("Retries:   {}", self.retries);
        println!("Elapsed:   {:.1?}", self.elapsed);
        println!("Speed:     {}/s", humansize::format_size(self.throughput as u64, humansize::BINARY));
    }
}
