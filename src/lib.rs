//! # bulkxfer - Chunked, Resumable Bulk Transfers
//!
//! bulkxfer moves large files between a local filesystem and an object store
//! that is reachable through a managed API or through short-lived, scoped
//! credential leases.
//!
//! ## Features
//!
//! - **Multipart Uploads**: Concurrent parts, ordered completion, abort on failure
//! - **Resumable Downloads**: Ranged writes at fixed offsets plus a sidecar record
//! - **Integrity Verification**: SHA-256, BLAKE3, XXHash3 and XXHash64 digests
//! - **Transfer Cache**: Unchanged files are skipped without touching the network
//! - **Retry with Backoff**: Exponential backoff with configurable jitter
//! - **Transport Selection**: Direct lease-based transport with managed fallback
//! - **Global Worker Budget**: One concurrency cap across every transfer
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulkxfer::config::TransferConfig;
//! use bulkxfer::core::{TransferRequest, TransferSession};
//! use bulkxfer::sync::TransferCache;
//! use bulkxfer::transport::{LocalObjectStore, TransportSelector};
//! use std::sync::Arc;
//!
//! let config = TransferConfig::default();
//! let store = Arc::new(LocalObjectStore::open("/srv/objects").unwrap());
//! let selector = TransportSelector::new(&config).with_managed(store);
//! let cache = Arc::new(TransferCache::open("/var/cache/bulkxfer.json"));
//!
//! let session = TransferSession::new(config, cache, selector).unwrap();
//! let outcome = session
//!     .transfer(&TransferRequest::upload("/data/big.bin", "datasets/big.bin"))
//!     .unwrap();
//! println!("{} ({} bytes moved)", outcome.status, outcome.bytes_transferred);
//! session.shutdown().unwrap();
//! ```
//!
//! ## Progress Events
//!
//! ```no_run
//! use bulkxfer::progress::{EventSink, ProgressReporter};
//!
//! let (events, receiver) = EventSink::channel();
//! let reporter = std::thread::spawn(move || ProgressReporter::new().run(receiver));
//! // pass `events` to TransferSession::with_events, run transfers, drop the session
//! drop(events);
//! reporter.join().unwrap().print();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod config;
pub mod core;
pub mod error;
pub mod fs;
pub mod hash;
pub mod progress;
pub mod retry;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::{HashAlgorithm, TransferConfig};
pub use core::{TransferOutcome, TransferRequest, TransferSession, TransferStatus};
pub use error::{ReasonCode, Result, TransferError};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use bulkxfer::prelude::*;
    //! ```

    pub use crate::chunk::{plan_parts, ByteRange, PartPlan};
    pub use crate::config::{HashAlgorithm, JitterMode, MismatchPolicy, TransferConfig};
    pub use crate::core::{
        CancellationToken, TransferOutcome, TransferRequest, TransferSession, TransferStatus,
    };
    pub use crate::error::{ReasonCode, Result, TransferError};
    pub use crate::hash::{hash_bytes, hash_file, Digest};
    pub use crate::progress::{EventSink, ProgressReporter, TransferEvent};
    pub use crate::retry::RetryPolicy;
    pub use crate::sync::TransferCache;
    pub use crate::transport::{
        CredentialProvider, DirectConnector, LocalObjectStore, ObjectRegistry, RemoteId,
        Transport, TransportSelector,
    };
}
