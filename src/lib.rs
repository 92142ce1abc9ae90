//! Pluggable byte sources and sinks for archive processing.
//!
//! Sources read byte ranges from memory, a whole network download, or a
//! range-capable network resource. Sinks accumulate writes in memory, in an
//! external file, or in a durable per-session block store coordinated by a
//! [`SessionRegistry`](session::SessionRegistry).

pub mod api;
pub mod config;
pub mod error;
pub mod session;
pub mod sink;
pub mod source;
pub mod storage;

pub use error::{Error, Result};
