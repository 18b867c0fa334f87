//! Transfer progress events
//!
//! The engine never draws anything itself; it emits [`TransferEvent`]s into
//! a crossbeam channel and whoever holds the receiver decides what to show.

use crate::core::TransferStatus;
use crate::error::ReasonCode;
use crate::transport::{Direction, RemoteId, TransportKind};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::time::Duration;

/// Something that happened during a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Transfer planned and about to move bytes
    Started {
        /// Object being transferred
        remote: RemoteId,
        /// Upload or download
        direction: Direction,
        /// Transport carrying the bytes
        transport: TransportKind,
        /// Object size
        total_bytes: u64,
        /// Number of parts or ranges in the plan
        parts: usize,
    },
    /// Bytes already durable from an earlier attempt
    Resumed {
        /// Object being transferred
        remote: RemoteId,
        /// Bytes that will not be moved again
        bytes: u64,
        /// Parts those bytes cover
        parts: usize,
    },
    /// One part accepted
    PartCompleted {
        /// Object being transferred
        remote: RemoteId,
        /// Part index in the plan
        index: usize,
        /// Part length
        bytes: u64,
    },
    /// A part failed and will be retried after `wait`
    PartRetry {
        /// Object being transferred
        remote: RemoteId,
        /// Part index in the plan
        index: usize,
        /// Failures so far for this part
        attempt: u32,
        /// Backoff before the next attempt
        wait: Duration,
        /// Classification of the failure
        reason: ReasonCode,
    },
    /// Transfer ended without error
    Finished {
        /// Object being transferred
        remote: RemoteId,
        /// Completed, skipped or cancelled
        status: TransferStatus,
        /// Bytes moved in this run
        bytes_transferred: u64,
    },
    /// Transfer ended with an error
    Failed {
        /// Object being transferred
        remote: RemoteId,
        /// Why the transfer stopped
        reason: ReasonCode,
    },
}

impl TransferEvent {
    /// Remote the event refers to
    pub fn remote(&self) -> &RemoteId {
        match self {
            Self::Started { remote, .. }
            | Self::Resumed { remote, .. }
            | Self::PartCompleted { remote, .. }
            | Self::PartRetry { remote, .. }
            | Self::Finished { remote, .. }
            | Self::Failed { remote, .. } => remote,
        }
    }
}

/// Sending half of the event channel; a disabled sink drops everything
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<TransferEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiver
    pub fn channel() -> (Self, Receiver<TransferEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards events
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Emit an event; a closed receiver is not an error
    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivers_in_order() {
        let (sink, rx) = EventSink::channel();
        let remote = RemoteId::new("obj");
        for index in 0..3 {
            sink.emit(TransferEvent::PartCompleted {
                remote: remote.clone(),
                index,
                bytes: 10,
            });
        }
        drop(sink);

        let indices: Vec<usize> = rx
            .iter()
            .map(|e| match e {
                TransferEvent::PartCompleted { index, .. } => index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_disabled_and_closed_sinks_are_silent() {
        EventSink::disabled().emit(TransferEvent::Failed {
            remote: RemoteId::new("x"),
            reason: ReasonCode::Terminal,
        });

        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(TransferEvent::Failed {
            remote: RemoteId::new("x"),
            reason: ReasonCode::Terminal,
        });
    }
}
