//! Transport module
//!
//! The object-transport boundary, credential leases, transport selection and
//! the bundled transports (filesystem store, optional native S3).

mod direct;
mod lease;
mod local;
#[cfg(feature = "native_s3")]
mod native_s3;
mod selector;
mod traits;

pub use direct::*;
pub use lease::*;
pub use local::*;
#[cfg(feature = "native_s3")]
pub use native_s3::*;
pub use selector::*;
pub use traits::*;
