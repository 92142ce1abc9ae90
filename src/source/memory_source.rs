use async_trait::async_trait;
use bytes::Bytes;

use super::traits::{ByteRangeSource, SourceInfo};
use crate::error::{Error, Result};

/// Source over a buffer already held in memory.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteRangeSource for MemorySource {
    async fn init(&self) -> Result<SourceInfo> {
        Ok(SourceInfo {
            size: self.data.len() as u64,
            range_capable: true,
        })
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        let size = self.data.len() as u64;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= size)
            .ok_or(Error::OutOfRange {
                offset,
                length,
                size,
            })?;
        Ok(self.data.slice(offset as usize..end as usize))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_slices() {
        let data: Vec<u8> = (0..=255u8).collect();
        let source = MemorySource::new(data.clone());

        let info = source.init().await.unwrap();
        assert_eq!(info.size, 256);
        assert_eq!(source.size(), 256);

        for (offset, length) in [(0u64, 1u64), (10, 20), (200, 56), (255, 1), (17, 0)] {
            let got = source.read_range(offset, length).await.unwrap();
            assert_eq!(&got[..], &data[offset as usize..(offset + length) as usize]);
        }
    }

    #[tokio::test]
    async fn test_memory_source_out_of_range() {
        let source = MemorySource::new(vec![0u8; 8]);
        let err = source.read_range(4, 5).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                offset: 4,
                length: 5,
                size: 8
            }
        ));
        assert!(source.read_range(u64::MAX, 2).await.is_err());
    }
}
