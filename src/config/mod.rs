//! Configuration module for bulkxfer
//!
//! Provides the validated transfer configuration value object and the
//! CLI arguments of the demonstration binary.

mod settings;

pub use settings::*;
