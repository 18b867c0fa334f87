//! Chunking module
//!
//! Splits payloads into ordered byte ranges sized for concurrent transfer.

mod plan;

pub use plan::*;
