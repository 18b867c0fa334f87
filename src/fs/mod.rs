//! File system helpers module
//!
//! Positional reads and writes used by the part workers, and bandwidth
//! throttling shared by all of them.

mod positional;
pub mod throttle;

pub use positional::*;
pub use throttle::BandwidthLimiter;
