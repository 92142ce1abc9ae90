// Error taxonomy shared by every source, sink, and the session registry.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to a network resource.
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The resource does not serve byte subranges.
    #[error("HTTP Range not supported by {url}")]
    RangeUnsupported { url: String },

    /// Missing or malformed response metadata, or an unexpected status.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Durable store open or transaction failure.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// Failure reported by an external writable handle.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("range {offset}+{length} out of bounds for size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("adapter used before a successful init")]
    Uninitialized,

    #[error("session registry is closed")]
    Closed,
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
