use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::traits::{Blob, ByteSink};
use crate::config::DEFAULT_CONTENT_TYPE;
use crate::error::{Error, Result};

/// Accumulates writes in a growable buffer.
pub struct MemorySink {
    content_type: String,
    buffer: Option<BytesMut>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_content_type(DEFAULT_CONTENT_TYPE)
    }

    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            buffer: None,
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn init(&mut self) -> Result<()> {
        self.buffer = Some(BytesMut::new());
        Ok(())
    }

    async fn write_bytes(&mut self, chunk: Bytes) -> Result<()> {
        let buffer = self.buffer.as_mut().ok_or(Error::Uninitialized)?;
        buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Blob> {
        let buffer = self.buffer.as_ref().ok_or(Error::Uninitialized)?;
        Ok(Blob::new(
            self.content_type.clone(),
            Bytes::copy_from_slice(buffer),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_concatenates_in_order() {
        let mut sink = MemorySink::with_content_type("application/zip");
        sink.init().await.unwrap();
        sink.write_bytes(Bytes::from_static(&[1, 2])).await.unwrap();
        sink.write_bytes(Bytes::new()).await.unwrap();
        sink.write_bytes(Bytes::from_static(&[3, 4, 5])).await.unwrap();

        let first = sink.finalize().await.unwrap();
        assert_eq!(&first.data[..], &[1, 2, 3, 4, 5]);
        assert_eq!(first.content_type, "application/zip");
        assert_eq!(sink.finalize().await.unwrap(), first);

        sink.write_bytes(Bytes::from_static(&[6])).await.unwrap();
        assert_eq!(sink.finalize().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_memory_sink_requires_init() {
        let mut sink = MemorySink::new();
        assert!(matches!(
            sink.write_bytes(Bytes::from_static(b"x")).await,
            Err(Error::Uninitialized)
        ));
    }
}
