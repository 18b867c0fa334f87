//! Retry module
//!
//! Error classification and exponential backoff with jitter.

mod policy;

pub use policy::*;
