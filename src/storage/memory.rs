// In-process stand-in for the durable stores. Shared by every registry that
// holds the same `Arc`, so sibling contexts can be simulated in one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::traits::{Block, BlockStorage, RegistryStore, SessionId, SessionRecord};

#[derive(Default)]
struct MemoryStore {
    next_seq: u64,
    blocks: BTreeMap<u64, Block>,
}

#[derive(Default)]
struct MemoryState {
    opened: bool,
    next_id: u64,
    instances: BTreeMap<SessionId, i64>,
    stores: HashMap<SessionId, MemoryStore>,
}

#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, as if the backing store were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("memory storage is unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for MemoryStorage {
    async fn open(&self) -> Result<()> {
        self.check()?;
        self.state.lock().opened = true;
        Ok(())
    }

    async fn register(&self, now: i64) -> Result<SessionId> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.opened {
            bail!("registry store is not open");
        }
        state.next_id += 1;
        let id = SessionId(state.next_id);
        state.instances.insert(id, now);
        Ok(id)
    }

    async fn heartbeat(&self, id: SessionId, now: i64) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        match state.instances.get_mut(&id) {
            Some(last) => {
                *last = (*last).max(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, id: SessionId) -> Result<()> {
        self.check()?;
        self.state.lock().instances.remove(&id);
        Ok(())
    }

    async fn take_stale(
        &self,
        expiration: i64,
        keep: Option<SessionId>,
    ) -> Result<Vec<SessionId>> {
        self.check()?;
        let mut state = self.state.lock();
        let stale: Vec<SessionId> = state
            .instances
            .iter()
            .filter(|(id, heartbeat)| **heartbeat < expiration && Some(**id) != keep)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.instances.remove(id);
        }
        Ok(stale)
    }

    async fn records(&self) -> Result<Vec<SessionRecord>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .instances
            .iter()
            .map(|(id, heartbeat)| SessionRecord {
                id: *id,
                last_heartbeat: *heartbeat,
            })
            .collect())
    }
}

#[async_trait]
impl BlockStorage for MemoryStorage {
    async fn create(&self, session: SessionId) -> Result<()> {
        self.check()?;
        self.state.lock().stores.entry(session).or_default();
        Ok(())
    }

    async fn append(&self, session: SessionId, payload: Bytes) -> Result<u64> {
        self.check()?;
        let mut state = self.state.lock();
        let store = state
            .stores
            .get_mut(&session)
            .ok_or_else(|| anyhow!("block store for session {} does not exist", session))?;
        store.next_seq += 1;
        let seq = store.next_seq;
        store.blocks.insert(
            seq,
            Block {
                owner: session,
                seq,
                payload,
            },
        );
        Ok(seq)
    }

    async fn get(&self, session: SessionId, seq: u64) -> Result<Option<Block>> {
        self.check()?;
        let state = self.state.lock();
        let store = state
            .stores
            .get(&session)
            .ok_or_else(|| anyhow!("block store for session {} does not exist", session))?;
        Ok(store.blocks.get(&seq).cloned())
    }

    async fn read(&self, session: SessionId, seqs: &[u64]) -> Result<Vec<Block>> {
        self.check()?;
        let state = self.state.lock();
        let store = state
            .stores
            .get(&session)
            .ok_or_else(|| anyhow!("block store for session {} does not exist", session))?;
        seqs.iter()
            .map(|seq| {
                store
                    .blocks
                    .get(seq)
                    .cloned()
                    .ok_or_else(|| anyhow!("block {} missing from session {}", seq, session))
            })
            .collect()
    }

    async fn exists(&self, session: SessionId) -> Result<bool> {
        self.check()?;
        Ok(self.state.lock().stores.contains_key(&session))
    }

    async fn delete(&self, session: SessionId) -> Result<()> {
        self.check()?;
        self.state.lock().stores.remove(&session);
        Ok(())
    }
}
