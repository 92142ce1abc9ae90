// Session registry: session identity, heartbeats, and reclaiming storage of
// sessions whose context went away without cleaning up.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broadcast::{Broadcast, FileBroadcast, Subscription};
use super::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::storage::{BlockStorage, RegistryStore, SessionId, SessionRecord};
use crate::storage::{SqliteBlocks, SqliteRegistry};

/// Lifecycle of a registry. `Opening` and `RegisteringSelf` are only observed
/// while `activate` is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Opening,
    RegisteringSelf,
    Active,
    Closed,
}

pub struct SessionRegistry {
    config: RegistryConfig,
    store: Arc<dyn RegistryStore>,
    blocks: Arc<dyn BlockStorage>,
    broadcast: Arc<dyn Broadcast>,
    clock: Arc<dyn Clock>,
    phase: RwLock<Phase>,
    session: RwLock<Option<SessionId>>,
    /// Timestamp of our last successful heartbeat write.
    last_beat: AtomicI64,
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        config: RegistryConfig,
        store: Arc<dyn RegistryStore>,
        blocks: Arc<dyn BlockStorage>,
        broadcast: Arc<dyn Broadcast>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            blocks,
            broadcast,
            clock,
            phase: RwLock::new(Phase::Uninitialized),
            session: RwLock::new(None),
            last_beat: AtomicI64::new(i64::MIN),
            lifecycle: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Registry over SQLite files and a polled signal file in `config.storage_dir`.
    pub fn open(config: RegistryConfig) -> Arc<Self> {
        let store = Arc::new(SqliteRegistry::new(config.registry_path()));
        let blocks = Arc::new(SqliteBlocks::new(&config.storage_dir, config.name.clone()));
        let broadcast = Arc::new(FileBroadcast::new(
            config.signal_path(),
            config.signal_poll(),
        ));
        Self::new(config, store, blocks, broadcast, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.read()
    }

    pub fn block_storage(&self) -> &Arc<dyn BlockStorage> {
        &self.blocks
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }

    /// Register this context and return its session id. Later calls return the same id.
    pub async fn activate(self: &Arc<Self>) -> Result<SessionId> {
        if let Some(id) = self.session_id() {
            return Ok(id);
        }

        let _guard = self.lifecycle.lock().await;
        match self.phase() {
            Phase::Closed => return Err(Error::Closed),
            Phase::Active => {
                if let Some(id) = self.session_id() {
                    return Ok(id);
                }
            }
            _ => {}
        }

        match self.bootstrap().await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("session registry activation failed: {}", e);
                self.set_phase(Phase::Uninitialized);
                Err(e)
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>) -> Result<SessionId> {
        // 1. Open or create the shared table.
        self.set_phase(Phase::Opening);
        self.store.open().await.map_err(Error::Storage)?;

        // 2. Insert our record; the store assigns the id.
        self.set_phase(Phase::RegisteringSelf);
        let now = self.clock.now_millis();
        let id = self.store.register(now).await.map_err(Error::Storage)?;
        self.last_beat.store(now, Ordering::SeqCst);

        // 3. Our dedicated block store.
        if let Err(e) = self.blocks.create(id).await {
            if let Err(undo) = self.store.remove(id).await {
                warn!("failed to unregister session {}: {:#}", id, undo);
            }
            return Err(Error::Storage(e));
        }

        *self.session.write() = Some(id);
        self.set_phase(Phase::Active);
        info!("session {} registered", id);

        // 4. Tell siblings to refresh, and refresh whenever they tell us.
        let subscription = self.broadcast.subscribe();
        if let Err(e) = self.broadcast.publish(now).await {
            warn!("session {} failed to signal siblings: {:#}", id, e);
        }

        // 5-6. Periodic heartbeat and the delayed staleness scan.
        self.spawn_background(id, subscription);
        Ok(id)
    }

    fn spawn_background(self: &Arc<Self>, id: SessionId, mut subscription: Subscription) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = subscription.recv() => signal,
                };
                let Some(at) = signal else { break };
                let Some(registry) = weak.upgrade() else { break };
                debug!("session {} refreshing after sibling signal at {}", id, at);
                registry.beat().await;
            }
        });

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; registration just stamped us.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = weak.upgrade() else { break };
                registry.beat().await;
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let delay = self.config.scan_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(registry) = weak.upgrade() else { return };
            // No retry: any context's next scan picks up what this one missed.
            if let Err(e) = registry.scan().await {
                warn!("staleness scan failed: {}", e);
            }
        });
    }

    async fn beat(&self) {
        if let Err(e) = self.heartbeat().await {
            warn!("heartbeat failed: {}", e);
        }
    }

    /// Refresh this session's heartbeat to the current time.
    pub async fn heartbeat(&self) -> Result<()> {
        if self.phase() == Phase::Closed {
            return Err(Error::Closed);
        }
        let id = self.session_id().ok_or(Error::Uninitialized)?;
        let now = self.clock.now_millis();
        let alive = self
            .store
            .heartbeat(id, now)
            .await
            .map_err(Error::Storage)?;
        if alive {
            self.last_beat.fetch_max(now, Ordering::SeqCst);
        } else {
            error!(
                "session {} is missing from the registry, its storage may have been reclaimed",
                id
            );
        }
        Ok(())
    }

    /// Delete registry records older than the max age, then their block stores.
    ///
    /// Returns the reclaimed ids. This context's own session is never collected.
    pub async fn scan(&self) -> Result<Vec<SessionId>> {
        if self.phase() == Phase::Closed {
            return Err(Error::Closed);
        }
        let now = self.clock.now_millis();
        let expiration = now - self.config.max_age_ms as i64;
        let own = self.session_id();

        if let Some(own) = own {
            let last = self.last_beat.load(Ordering::SeqCst);
            if last < expiration {
                error!(
                    "session {} heartbeat is stale (last={} expiration={})",
                    own, last, expiration
                );
            }
        }

        let stale = self
            .store
            .take_stale(expiration, own)
            .await
            .map_err(Error::Storage)?;

        for id in &stale {
            if let Err(e) = self.blocks.delete(*id).await {
                warn!("failed to delete block store of stale session {}: {:#}", id, e);
            }
        }
        if stale.is_empty() {
            debug!("staleness scan found nothing older than {}", expiration);
        } else {
            info!("staleness scan reclaimed {} session(s): {:?}", stale.len(), stale);
        }
        Ok(stale)
    }

    /// Snapshot of every record in the shared table.
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store.records().await.map_err(Error::Storage)
    }

    /// Tear down: stop background work and delete this session's block store and record.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.phase() == Phase::Closed {
            return Ok(());
        }

        // Nothing is committed until the store is gone, so a failed close can be retried.
        let Some(id) = self.session_id() else {
            self.set_phase(Phase::Closed);
            self.shutdown.cancel();
            return Ok(());
        };
        if let Err(e) = self.blocks.delete(id).await {
            warn!("session {} close failed, block store kept: {:#}", id, e);
            return Err(Error::Storage(e));
        }

        self.session.write().take();
        self.set_phase(Phase::Closed);
        self.shutdown.cancel();
        if let Err(e) = self.store.remove(id).await {
            warn!("failed to remove registry record of session {}: {:#}", id, e);
        }
        info!("session {} closed", id);
        Ok(())
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(id) = *self.session.read() {
            warn!(
                "session registry dropped while active, session {} left for a sibling scan",
                id
            );
        }
    }
}
