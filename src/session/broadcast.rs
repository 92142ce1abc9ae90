// Cross-context "someone changed state, re-check" signal.
//
// A signal carries only a timestamp. Subscribers never see their own endpoint's
// publishes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

const SIGNAL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Envelope {
    from: Uuid,
    at: i64,
}

/// Receiving half of a broadcast endpoint.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    me: Uuid,
}

impl Subscription {
    /// Timestamp of the next signal from another endpoint, or `None` once the medium closes.
    pub async fn recv(&mut self) -> Option<i64> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.from == self.me => continue,
                Ok(envelope) => return Some(envelope.at),
                Err(RecvError::Lagged(missed)) => {
                    debug!("signal subscriber lagged, {} signals coalesced", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Broadcast: Send + Sync {
    async fn publish(&self, at: i64) -> Result<()>;

    fn subscribe(&self) -> Subscription;
}

/// In-process medium. Every endpoint created from the same hub hears the others.
#[derive(Clone)]
pub struct LocalBroadcast {
    tx: broadcast::Sender<Envelope>,
    me: Uuid,
}

impl LocalBroadcast {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            tx,
            me: Uuid::new_v4(),
        }
    }

    /// A new endpoint on the same hub.
    pub fn endpoint(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            me: Uuid::new_v4(),
        }
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcast for LocalBroadcast {
    async fn publish(&self, at: i64) -> Result<()> {
        // No receivers is not an error.
        let _ = self.tx.send(Envelope { from: self.me, at });
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            me: self.me,
        }
    }
}

/// Polling fallback over a shared signal file, for contexts in different processes.
///
/// `publish` replaces the file's contents with `{endpoint} {timestamp}`. A poll
/// task, started by the first `subscribe`, forwards every change to subscribers,
/// which drop the ones this endpoint wrote.
pub struct FileBroadcast {
    path: PathBuf,
    poll: Duration,
    tx: broadcast::Sender<Envelope>,
    me: Uuid,
    polling: AtomicBool,
    shutdown: CancellationToken,
}

impl FileBroadcast {
    pub fn new(path: impl Into<PathBuf>, poll: Duration) -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            path: path.into(),
            poll,
            tx,
            me: Uuid::new_v4(),
            polling: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn start_polling(&self) {
        if self.polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let path = self.path.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let poll = self.poll;

        tokio::spawn(async move {
            let mut seen = read_signal(&path).await;
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = read_signal(&path).await;
                if current.is_none() || current == seen {
                    continue;
                }
                seen = current;
                if let Some(envelope) = current {
                    let _ = tx.send(envelope);
                }
            }
            debug!("signal poller for {} stopped", path.display());
        });
    }
}

async fn read_signal(path: &Path) -> Option<Envelope> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let (from, at) = raw.trim().split_once(' ')?;
    Some(Envelope {
        from: Uuid::parse_str(from).ok()?,
        at: at.parse().ok()?,
    })
}

#[async_trait]
impl Broadcast for FileBroadcast {
    async fn publish(&self, at: i64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.with_context(|| {
                format!("failed to create signal directory: {}", dir.display())
            })?;
        }
        // Write then rename so pollers never read a torn value.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}", self.me.simple()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, format!("{} {}", self.me.simple(), at))
            .await
            .with_context(|| format!("failed to write signal file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to publish signal: {}", self.path.display()))?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.start_polling();
        Subscription {
            rx: self.tx.subscribe(),
            me: self.me,
        }
    }
}

impl Drop for FileBroadcast {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_endpoints_hear_each_other_not_themselves() {
        let a = LocalBroadcast::new();
        let b = a.endpoint();
        let mut sub_a = a.subscribe();
        let mut sub_b = b.subscribe();

        a.publish(10).await.unwrap();
        b.publish(20).await.unwrap();

        assert_eq!(sub_a.recv().await, Some(20));
        assert_eq!(sub_b.recv().await, Some(10));
    }

    #[tokio::test]
    async fn test_file_broadcast_forwards_sibling_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.signal");
        let poll = Duration::from_millis(10);
        let a = FileBroadcast::new(&path, poll);
        let b = FileBroadcast::new(&path, poll);

        let mut sub_a = a.subscribe();
        let mut sub_b = b.subscribe();
        // Let both pollers take their initial reading.
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.publish(1234).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub_a.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(1234));

        // b wrote that value itself, so it must not hear it.
        let own = tokio::time::timeout(Duration::from_millis(100), sub_b.recv()).await;
        assert!(own.is_err());
    }

    #[tokio::test]
    async fn test_file_broadcast_same_timestamp_from_two_endpoints() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.signal");
        let poll = Duration::from_millis(10);
        let a = FileBroadcast::new(&path, poll);
        let b = FileBroadcast::new(&path, poll);

        let mut sub_a = a.subscribe();
        let mut sub_b = b.subscribe();
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.publish(777).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub_b.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(777));

        // Same millisecond from the sibling still counts as a new signal.
        b.publish(777).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub_a.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(777));
    }
}
