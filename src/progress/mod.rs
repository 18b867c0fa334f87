//! Progress reporting module
//!
//! Transfer events emitted by the engine, and an indicatif reporter that
//! renders them with byte totals, throughput and ETA.

mod events;
mod reporter;

pub use events::*;
pub use reporter::*;
