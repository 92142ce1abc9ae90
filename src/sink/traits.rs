use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Materialized sink output: the accumulated bytes plus a content label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content_type: String,
    pub data: Bytes,
}

impl Blob {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Append-only byte destination.
///
/// Writes take `&mut self`, so a write must be acknowledged before the next one
/// can be issued. A failed `init` leaves the sink unusable; a failed write does not.
#[async_trait]
pub trait ByteSink: Send {
    async fn init(&mut self) -> Result<()>;

    async fn write_bytes(&mut self, chunk: Bytes) -> Result<()>;

    /// Everything written so far as one labeled unit. Idempotent.
    async fn finalize(&mut self) -> Result<Blob>;
}
