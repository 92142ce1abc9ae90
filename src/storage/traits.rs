use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Identity assigned to a session by the shared registry store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the shared registry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Milliseconds since the UNIX epoch.
    pub last_heartbeat: i64,
}

/// One immutable chunk of a session's block store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub owner: SessionId,
    pub seq: u64,
    pub payload: Bytes,
}

/// Shared table mapping session id to its last heartbeat.
///
/// Every method is a single transaction; siblings may call concurrently.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Open or create the table. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Insert a record stamped `now` and return the store-assigned id.
    async fn register(&self, now: i64) -> Result<SessionId>;

    /// Raise the record's heartbeat to `now`. Returns `false` if the record is gone.
    async fn heartbeat(&self, id: SessionId, now: i64) -> Result<bool>;

    async fn remove(&self, id: SessionId) -> Result<()>;

    /// Delete every record older than `expiration` (except `keep`) and return their ids.
    async fn take_stale(&self, expiration: i64, keep: Option<SessionId>)
        -> Result<Vec<SessionId>>;

    async fn records(&self) -> Result<Vec<SessionRecord>>;
}

/// Per-session durable append-only block stores.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Create the session's store if it does not exist yet.
    async fn create(&self, session: SessionId) -> Result<()>;

    /// Append a block and return its sequence id. Fails if the store does not exist.
    async fn append(&self, session: SessionId, payload: Bytes) -> Result<u64>;

    async fn get(&self, session: SessionId, seq: u64) -> Result<Option<Block>>;

    /// Read the given blocks in the given order. Any missing block is an error.
    async fn read(&self, session: SessionId, seqs: &[u64]) -> Result<Vec<Block>>;

    async fn exists(&self, session: SessionId) -> Result<bool>;

    /// Delete the whole store. Deleting an absent store succeeds.
    async fn delete(&self, session: SessionId) -> Result<()>;
}
