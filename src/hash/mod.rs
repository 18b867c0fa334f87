//! Hash computation and integrity verification module
//!
//! Provides SHA-256, BLAKE3 and XXHash digests for part verification and
//! whole-file integrity checks.

mod integrity;

pub use integrity::*;
