// SQLite-backed registry table and per-session block stores.
//
// One registry database per storage directory, one database file per session.
// All SQLite work runs on the blocking pool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::traits::{Block, BlockStorage, RegistryStore, SessionId, SessionRecord};
use crate::config::SQLITE_BUSY_TIMEOUT_MS;

fn open_connection(path: &Path, create: bool) -> Result<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("failed to open database: {}", path.display()))?;
    conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("{} task failed: {}", what, e))?
}

/// The shared `instances` table.
pub struct SqliteRegistry {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(what, move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or_else(|| anyhow!("registry store is not open"))?;
            f(conn)
        })
        .await
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistry {
    async fn open(&self) -> Result<()> {
        let path = self.path.clone();
        let slot = Arc::clone(&self.conn);
        blocking("registry open", move || {
            let mut guard = slot.lock();
            if guard.is_some() {
                return Ok(());
            }
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create storage directory: {}", dir.display())
                })?;
            }
            let conn = open_connection(&path, true)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS instances (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    heartbeat INTEGER NOT NULL
                );",
            )
            .context("failed to initialize registry schema")?;
            info!("session registry opened at {}", path.display());
            *guard = Some(conn);
            Ok(())
        })
        .await
    }

    async fn register(&self, now: i64) -> Result<SessionId> {
        self.with_conn("registry insert", move |conn| {
            conn.execute("INSERT INTO instances (heartbeat) VALUES (?1)", params![now])
                .context("failed to insert session record")?;
            Ok(SessionId(conn.last_insert_rowid() as u64))
        })
        .await
    }

    async fn heartbeat(&self, id: SessionId, now: i64) -> Result<bool> {
        self.with_conn("registry heartbeat", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE instances SET heartbeat = MAX(heartbeat, ?2) WHERE id = ?1",
                    params![id.0 as i64, now],
                )
                .context("failed to refresh heartbeat")?;
            Ok(changed > 0)
        })
        .await
    }

    async fn remove(&self, id: SessionId) -> Result<()> {
        self.with_conn("registry remove", move |conn| {
            conn.execute("DELETE FROM instances WHERE id = ?1", params![id.0 as i64])
                .context("failed to delete session record")?;
            Ok(())
        })
        .await
    }

    async fn take_stale(
        &self,
        expiration: i64,
        keep: Option<SessionId>,
    ) -> Result<Vec<SessionId>> {
        self.with_conn("registry scan", move |conn| {
            let keep = keep.map(|id| id.0 as i64);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin scan transaction")?;
            let stale = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM instances WHERE heartbeat < ?1 AND id IS NOT ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![expiration, keep], |row| row.get::<_, i64>(0))?;
                let mut stale = Vec::new();
                for row in rows {
                    stale.push(SessionId(row.context("failed to read session row")? as u64));
                }
                stale
            };
            for id in &stale {
                tx.execute("DELETE FROM instances WHERE id = ?1", params![id.0 as i64])?;
            }
            tx.commit().context("failed to commit scan transaction")?;
            Ok(stale)
        })
        .await
    }

    async fn records(&self) -> Result<Vec<SessionRecord>> {
        self.with_conn("registry list", |conn| {
            let mut stmt = conn.prepare("SELECT id, heartbeat FROM instances ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(SessionRecord {
                    id: SessionId(row.get::<_, i64>(0)? as u64),
                    last_heartbeat: row.get(1)?,
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.context("failed to read session row")?);
            }
            Ok(records)
        })
        .await
    }
}

type SharedConn = Arc<Mutex<Connection>>;

/// One `blocks` database per session, named `{name}_{id}.db`.
pub struct SqliteBlocks {
    dir: PathBuf,
    name: String,
    conns: Arc<Mutex<HashMap<SessionId, SharedConn>>>,
}

impl SqliteBlocks {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            conns: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store_path(&self, session: SessionId) -> PathBuf {
        self.dir.join(format!("{}_{}.db", self.name, session))
    }

    /// Cached connection to an existing store. Never creates the file.
    fn connection(
        conns: &Mutex<HashMap<SessionId, SharedConn>>,
        path: &Path,
        session: SessionId,
    ) -> Result<SharedConn> {
        if !path.exists() {
            conns.lock().remove(&session);
            bail!("block store for session {} does not exist", session);
        }
        if let Some(conn) = conns.lock().get(&session) {
            return Ok(Arc::clone(conn));
        }
        let conn = Arc::new(Mutex::new(open_connection(path, false)?));
        conns.lock().insert(session, Arc::clone(&conn));
        Ok(conn)
    }

    async fn with_store<T, F>(&self, what: &'static str, session: SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conns = Arc::clone(&self.conns);
        let path = self.store_path(session);
        blocking(what, move || {
            let conn = Self::connection(&conns, &path, session)?;
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
    }
}

fn read_block(conn: &Connection, seq: u64) -> Result<Option<Block>> {
    conn.query_row(
        "SELECT owner, data FROM blocks WHERE seq = ?1",
        params![seq as i64],
        |row| {
            Ok(Block {
                owner: SessionId(row.get::<_, i64>(0)? as u64),
                seq,
                payload: Bytes::from(row.get::<_, Vec<u8>>(1)?),
            })
        },
    )
    .optional()
    .with_context(|| format!("failed to read block {}", seq))
}

#[async_trait]
impl BlockStorage for SqliteBlocks {
    async fn create(&self, session: SessionId) -> Result<()> {
        let conns = Arc::clone(&self.conns);
        let dir = self.dir.clone();
        let path = self.store_path(session);
        blocking("block store create", move || {
            fs::create_dir_all(&dir).with_context(|| {
                format!("failed to create storage directory: {}", dir.display())
            })?;
            let conn = open_connection(&path, true)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS blocks (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner INTEGER NOT NULL,
                    data BLOB NOT NULL
                );",
            )
            .context("failed to initialize block store schema")?;
            conns.lock().insert(session, Arc::new(Mutex::new(conn)));
            debug!("block store ready at {}", path.display());
            Ok(())
        })
        .await
    }

    async fn append(&self, session: SessionId, payload: Bytes) -> Result<u64> {
        self.with_store("block append", session, move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO blocks (owner, data) VALUES (?1, ?2)",
                params![session.0 as i64, payload.as_ref()],
            )
            .context("failed to append block")?;
            let seq = tx.last_insert_rowid() as u64;
            tx.commit().context("failed to commit block")?;
            Ok(seq)
        })
        .await
    }

    async fn get(&self, session: SessionId, seq: u64) -> Result<Option<Block>> {
        self.with_store("block get", session, move |conn| read_block(conn, seq))
            .await
    }

    async fn read(&self, session: SessionId, seqs: &[u64]) -> Result<Vec<Block>> {
        let seqs = seqs.to_vec();
        self.with_store("block read", session, move |conn| {
            let tx = conn.transaction()?;
            let mut blocks = Vec::with_capacity(seqs.len());
            for seq in seqs {
                let block = read_block(&tx, seq)?
                    .ok_or_else(|| anyhow!("block {} missing from session {}", seq, session))?;
                blocks.push(block);
            }
            tx.commit()?;
            Ok(blocks)
        })
        .await
    }

    async fn exists(&self, session: SessionId) -> Result<bool> {
        Ok(self.store_path(session).exists())
    }

    async fn delete(&self, session: SessionId) -> Result<()> {
        let conns = Arc::clone(&self.conns);
        let path = self.store_path(session);
        blocking("block store delete", move || {
            // Close our handle before unlinking.
            drop(conns.lock().remove(&session));
            for suffix in ["", "-journal", "-wal", "-shm"] {
                let mut target = path.clone().into_os_string();
                target.push(suffix);
                match fs::remove_file(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("failed to delete block store {}", path.display())
                        })
                    }
                }
            }
            debug!("block store deleted at {}", path.display());
            Ok(())
        })
        .await
    }
}
