//! Persistent transfer bookkeeping
//!
//! Provides:
//! - The local transfer cache used to skip unchanged transfers
//! - Download resume sidecars tracking durable byte ranges

mod cache;
mod sidecar;

pub use cache::*;
pub use sidecar::*;
