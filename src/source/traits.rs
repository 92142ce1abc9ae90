use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// What `init` learned about a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub size: u64,
    pub range_capable: bool,
}

/// Resolved metadata of a network resource. Immutable once `init` succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub url: String,
    pub size: u64,
    pub range_capable: bool,
}

impl SourceDescriptor {
    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            size: self.size,
            range_capable: self.range_capable,
        }
    }
}

#[async_trait]
pub trait ByteRangeSource: Send + Sync {
    async fn init(&self) -> Result<SourceInfo>;

    /// Produce exactly `length` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes>;

    /// Total size in bytes, or 0 while unresolved.
    fn size(&self) -> u64;
}
