// Durable block-store sink: every write becomes one block in this session's
// store; only block references are kept in memory.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::traits::{Blob, ByteSink};
use crate::error::{Error, Result};
use crate::session::SessionRegistry;
use crate::storage::SessionId;

/// Stable reference to a block that has been written and read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub seq: u64,
    pub len: usize,
}

pub struct BlockSink {
    registry: Arc<SessionRegistry>,
    content_type: String,
    session: Option<SessionId>,
    refs: Vec<BlockRef>,
    /// Last finalized output and how many blocks it covered.
    finalized: Option<(usize, Blob)>,
}

impl BlockSink {
    pub fn new(registry: Arc<SessionRegistry>, content_type: impl Into<String>) -> Self {
        Self {
            registry,
            content_type: content_type.into(),
            session: None,
            refs: Vec::new(),
            finalized: None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    /// References to this sink's blocks, in append order.
    pub fn blocks(&self) -> &[BlockRef] {
        &self.refs
    }
}

#[async_trait]
impl ByteSink for BlockSink {
    async fn init(&mut self) -> Result<()> {
        let session = self.registry.activate().await?;
        // The store was created at activation. If a sibling's scan reclaimed
        // the session since, recreating it would leave a store no scan can find.
        let present = self
            .registry
            .block_storage()
            .exists(session)
            .await
            .map_err(Error::Storage)?;
        let registered = self
            .registry
            .sessions()
            .await?
            .iter()
            .any(|record| record.id == session);
        if !present || !registered {
            return Err(Error::Storage(anyhow!(
                "session {} was reclaimed by a staleness scan",
                session
            )));
        }
        self.session = Some(session);
        Ok(())
    }

    async fn write_bytes(&mut self, chunk: Bytes) -> Result<()> {
        let session = self.session.ok_or(Error::Uninitialized)?;
        let storage = self.registry.block_storage();
        let len = chunk.len();

        let seq = storage
            .append(session, chunk)
            .await
            .map_err(Error::Storage)?;

        // Read back before acknowledging, so the reference is known to resolve.
        let stored = storage
            .get(session, seq)
            .await
            .map_err(Error::Storage)?
            .ok_or_else(|| {
                Error::Storage(anyhow!("block {} vanished from session {}", seq, session))
            })?;
        if stored.payload.len() != len {
            return Err(Error::Storage(anyhow!(
                "block {} read back {} bytes, wrote {}",
                seq,
                stored.payload.len(),
                len
            )));
        }

        self.refs.push(BlockRef { seq, len });
        debug!("session {} stored block {} ({} bytes)", session, seq, len);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Blob> {
        let session = self.session.ok_or(Error::Uninitialized)?;
        if let Some((count, blob)) = &self.finalized {
            if *count == self.refs.len() {
                return Ok(blob.clone());
            }
        }

        let seqs: Vec<u64> = self.refs.iter().map(|r| r.seq).collect();
        let blocks = self
            .registry
            .block_storage()
            .read(session, &seqs)
            .await
            .map_err(Error::Storage)?;

        let total = self.refs.iter().map(|r| r.len).sum();
        let mut data = BytesMut::with_capacity(total);
        for block in &blocks {
            data.extend_from_slice(&block.payload);
        }

        let blob = Blob::new(self.content_type.clone(), data.freeze());
        self.finalized = Some((self.refs.len(), blob.clone()));
        Ok(blob)
    }
}
