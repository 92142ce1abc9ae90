use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::traits::{Blob, ByteSink};
use crate::error::{Error, Result};

/// An externally owned, persisted file that can hand out a writer and later
/// materialize its full contents.
#[async_trait]
pub trait FileEntry: Send + Sync {
    type Writer: EntryWriter;

    async fn create_writer(&self) -> io::Result<Self::Writer>;

    async fn contents(&self) -> io::Result<Bytes>;
}

#[async_trait]
pub trait EntryWriter: Send {
    /// Resolves once the chunk has been handed to the underlying file.
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// [`FileEntry`] for a path on the local filesystem. The file is truncated
/// when a writer is created.
#[derive(Debug, Clone)]
pub struct FsEntry {
    path: PathBuf,
}

impl FsEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct FsWriter {
    file: File,
}

#[async_trait]
impl EntryWriter for FsWriter {
    async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.file.flush().await
    }
}

#[async_trait]
impl FileEntry for FsEntry {
    type Writer = FsWriter;

    async fn create_writer(&self) -> io::Result<FsWriter> {
        let file = File::create(&self.path).await?;
        Ok(FsWriter { file })
    }

    async fn contents(&self) -> io::Result<Bytes> {
        tokio::fs::read(&self.path).await.map(Bytes::from)
    }
}

/// Forwards every write to an external file handle.
pub struct HandleSink<E: FileEntry> {
    entry: E,
    content_type: String,
    writer: Option<E::Writer>,
}

impl<E: FileEntry> HandleSink<E> {
    pub fn new(entry: E, content_type: impl Into<String>) -> Self {
        Self {
            entry,
            content_type: content_type.into(),
            writer: None,
        }
    }

    pub fn entry(&self) -> &E {
        &self.entry
    }
}

#[async_trait]
impl<E: FileEntry> ByteSink for HandleSink<E> {
    async fn init(&mut self) -> Result<()> {
        let writer = self
            .entry
            .create_writer()
            .await
            .context("failed to create entry writer")
            .map_err(Error::Storage)?;
        self.writer = Some(writer);
        Ok(())
    }

    async fn write_bytes(&mut self, chunk: Bytes) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::Uninitialized)?;
        writer.write(&chunk).await?;
        debug!("handle sink wrote {} bytes", chunk.len());
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Blob> {
        if self.writer.is_none() {
            return Err(Error::Uninitialized);
        }
        let data = self.entry.contents().await?;
        Ok(Blob::new(self.content_type.clone(), data))
    }
}
