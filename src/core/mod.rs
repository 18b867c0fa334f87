//! Core transfer engine module
//!
//! Provides the transfer session, the upload and download coordinators,
//! the part dispatcher and the global worker limiter they share.

mod dispatch;
mod download;
mod pool;
mod session;
mod state;
#[cfg(test)]
pub(crate) mod test_support;
mod upload;

pub use dispatch::*;
pub use download::*;
pub use pool::*;
pub use session::*;
pub use state::*;
pub use upload::*;
