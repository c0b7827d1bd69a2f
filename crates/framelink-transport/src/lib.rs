//! Local socket transport for framelink.
//!
//! Provides the Unix domain socket plumbing used by the socket frame channel:
//! - listener bind with stale socket cleanup
//! - bounded accept for a consumer waiting on its producer
//! - connect with exponential backoff for a producer racing its consumer
//!
//! Everything above the raw byte stream lives in `framelink-frame`.

#[cfg(not(unix))]
compile_error!("framelink-transport only supports Unix-like operating systems.");

pub mod backoff;
pub mod error;
pub mod traits;
pub mod uds;

pub use backoff::Backoff;
pub use error::{Result, TransportError};
pub use traits::IpcStream;
pub use uds::UnixDomainSocket;
