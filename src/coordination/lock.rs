//! Distributed mutual exclusion
//!
//! [`DistributedLock`] queues a sequential ephemeral child under the lock
//! path; the waiter whose child is the lowest-numbered surviving child holds
//! the lock. Acquisition is FIFO across processes and reentrant within one
//! process.
//!
//! [`PersistentLock`] records its owner durably so health checks can detect
//! an abandoned lock after the holder process died and let a different node
//! resume the protected job.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fixed backoff between ownership polls
const POLL_INTERVAL: Duration = Duration::from_millis(25);

// =============================================================================
// Distributed Lock
// =============================================================================

#[derive(Debug, Default)]
struct LockState {
    /// Full path of our queued child while acquired
    my_node: Option<String>,
    /// Per-process reentrancy count
    reentrancy: u32,
}

/// Fair, reentrant distributed mutex
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    name: String,
    owner_id: String,
    state: tokio::sync::Mutex<LockState>,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            owner_id: owner_id.into(),
            state: tokio::sync::Mutex::new(LockState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the lock, waiting up to `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.my_node.is_some() {
            // Reentrant within the same process
            state.reentrancy += 1;
            return Ok(());
        }

        let started = Instant::now();
        let prefix = format!("{}/lock-", paths::lock(&self.name));
        let my_node = self
            .store
            .create_node(&prefix, self.owner_id.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        let my_name = child_name(&my_node);

        loop {
            let children = self.store.list_children(&paths::lock(&self.name)).await?;
            if is_lowest(&my_name, &children) {
                debug!(lock = %self.name, owner = %self.owner_id, "lock acquired");
                state.my_node = Some(my_node);
                state.reentrancy = 1;
                return Ok(());
            }
            if started.elapsed() >= timeout {
                // Withdraw from the queue so we never become a ghost holder
                let _ = self.store.delete_node(&my_node).await;
                return Err(Error::Timeout {
                    operation: format!("acquire lock {}", self.name),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release one level of the lock; the queue node is deleted when the
    /// reentrancy count reaches zero
    pub async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.reentrancy == 0 {
            return Err(Error::LockNotHeld {
                name: self.name.clone(),
            });
        }
        state.reentrancy -= 1;
        if state.reentrancy == 0 {
            if let Some(node) = state.my_node.take() {
                self.store.delete_node(&node).await?;
                debug!(lock = %self.name, owner = %self.owner_id, "lock released");
            }
        }
        Ok(())
    }

    /// Whether this process currently holds the lock
    pub async fn is_held(&self) -> bool {
        self.state.lock().await.my_node.is_some()
    }

    /// Read the current cluster-wide holder, if any
    pub async fn holder(&self) -> Result<Option<String>> {
        let base = paths::lock(&self.name);
        let children = self.store.list_children(&base).await?;
        let lowest = children
            .iter()
            .filter(|c| paths::sequence_of(c).is_some())
            .min_by_key(|c| paths::sequence_of(c));
        match lowest {
            Some(child) => {
                let data = self.store.read_node(&format!("{base}/{child}")).await?;
                Ok(data.map(|d| String::from_utf8_lossy(&d).into_owned()))
            }
            None => Ok(None),
        }
    }
}

fn child_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn is_lowest(my_name: &str, children: &[String]) -> bool {
    let my_seq = match paths::sequence_of(my_name) {
        Some(seq) => seq,
        None => return false,
    };
    children
        .iter()
        .filter_map(|c| paths::sequence_of(c))
        .all(|seq| seq >= my_seq)
}

// =============================================================================
// Persistent Lock
// =============================================================================

/// Durable record of a persistent lock's owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentLockRecord {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Lock whose ownership record survives the acquirer's session
pub struct PersistentLock {
    store: Arc<dyn CoordinationStore>,
    name: String,
    node_id: String,
}

impl PersistentLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            node_id: node_id.into(),
        }
    }

    /// Acquire, or resume if this node already owns the record
    pub async fn acquire(&self) -> Result<()> {
        let record = PersistentLockRecord {
            owner: self.node_id.clone(),
            acquired_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&record)?;
        let path = paths::persistent_lock(&self.name);
        if self.store.compare_and_swap(&path, None, &payload).await? {
            debug!(lock = %self.name, owner = %self.node_id, "persistent lock acquired");
            return Ok(());
        }
        match self.owner().await? {
            Some(existing) if existing.owner == self.node_id => Ok(()),
            Some(existing) => Err(Error::LockHeld {
                name: self.name.clone(),
                holder: existing.owner,
            }),
            // Owner vanished between CAS and read; retryable
            None => Err(Error::VersionConflict { path }),
        }
    }

    /// Read the recorded owner, regardless of whose session is alive
    pub async fn owner(&self) -> Result<Option<PersistentLockRecord>> {
        let path = paths::persistent_lock(&self.name);
        match self.store.read_node(&path).await? {
            Some(data) => {
                let record =
                    serde_json::from_slice(&data).map_err(|e| Error::CorruptedRecord {
                        path,
                        reason: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Release, verifying ownership first
    pub async fn release(&self) -> Result<()> {
        match self.owner().await? {
            Some(record) if record.owner == self.node_id => {
                self.store
                    .delete_node(&paths::persistent_lock(&self.name))
                    .await
            }
            Some(record) => Err(Error::LockHeld {
                name: self.name.clone(),
                holder: record.owner,
            }),
            None => Err(Error::LockNotHeld {
                name: self.name.clone(),
            }),
        }
    }

    /// Remove the record without ownership checks. Used to recover a lock
    /// abandoned by a dead holder.
    pub async fn force_release(&self) -> Result<()> {
        match self
            .store
            .delete_node(&paths::persistent_lock(&self.name))
            .await
        {
            Ok(()) | Err(Error::NodeNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordination;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_mutual_exclusion_and_fifo_handoff() {
        let cluster = MemoryCoordination::new();
        let counter = Arc::new(AtomicU32::new(0));
        let mut order = Vec::new();

        let first = DistributedLock::new(cluster.connect(), "target", "node-1");
        first.acquire(Duration::from_secs(1)).await.unwrap();

        let mut waiters = Vec::new();
        for i in 2..=4 {
            let lock = DistributedLock::new(cluster.connect(), "target", format!("node-{i}"));
            let counter = counter.clone();
            // Queue in request order
            tokio::time::sleep(Duration::from_millis(5)).await;
            waiters.push(tokio::spawn(async move {
                lock.acquire(Duration::from_secs(5)).await.unwrap();
                let position = counter.fetch_add(1, Ordering::SeqCst);
                lock.release().await.unwrap();
                (i, position)
            }));
        }

        // Nobody progresses while the lock is held
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        first.release().await.unwrap();
        for waiter in waiters {
            order.push(waiter.await.unwrap());
        }
        order.sort_by_key(|(i, _)| *i);
        // FIFO: node-2 before node-3 before node-4
        assert_eq!(order, vec![(2, 0), (3, 1), (4, 2)]);
    }

    #[tokio::test]
    async fn test_reentrancy_is_per_process() {
        let cluster = MemoryCoordination::new();
        let lock = DistributedLock::new(cluster.connect(), "reentrant", "node-1");

        lock.acquire(Duration::from_secs(1)).await.unwrap();
        lock.acquire(Duration::from_secs(1)).await.unwrap();
        lock.release().await.unwrap();
        assert!(lock.is_held().await);
        lock.release().await.unwrap();
        assert!(!lock.is_held().await);

        assert!(matches!(
            lock.release().await,
            Err(Error::LockNotHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_timeout_withdraws_from_queue() {
        let cluster = MemoryCoordination::new();
        let holder = DistributedLock::new(cluster.connect(), "busy", "node-1");
        holder.acquire(Duration::from_secs(1)).await.unwrap();

        let contender = DistributedLock::new(cluster.connect(), "busy", "node-2");
        let err = contender.acquire(Duration::from_millis(80)).await.unwrap_err();
        assert!(err.is_timeout());

        // The timed-out waiter left the queue; only the holder remains
        assert_eq!(holder.holder().await.unwrap(), Some("node-1".to_string()));
        let children = holder
            .store
            .list_children(&paths::lock("busy"))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_released_by_session_expiry() {
        let cluster = MemoryCoordination::new();
        let holder_session = cluster.connect();
        let holder_id = holder_session.session_id();
        let holder = DistributedLock::new(holder_session, "failover", "node-1");
        holder.acquire(Duration::from_secs(1)).await.unwrap();

        let contender = DistributedLock::new(cluster.connect(), "failover", "node-2");
        let acquire = tokio::spawn(async move {
            contender.acquire(Duration::from_secs(5)).await.unwrap();
            contender
        });

        cluster.expire_session(holder_id);
        let contender = acquire.await.unwrap();
        assert!(contender.is_held().await);
    }

    #[tokio::test]
    async fn test_persistent_lock_survives_owner_session() {
        let cluster = MemoryCoordination::new();
        let owner_session = cluster.connect();
        let owner_id = owner_session.session_id();
        let lock = PersistentLock::new(owner_session, "db-repair", "node-1");
        lock.acquire().await.unwrap();

        cluster.expire_session(owner_id);

        // Another node still sees the recorded owner
        let other = PersistentLock::new(cluster.connect(), "db-repair", "node-2");
        let record = other.owner().await.unwrap().unwrap();
        assert_eq!(record.owner, "node-1");

        assert!(matches!(other.acquire().await, Err(Error::LockHeld { .. })));

        // Abandoned-lock recovery
        other.force_release().await.unwrap();
        other.acquire().await.unwrap();
        assert_eq!(other.owner().await.unwrap().unwrap().owner, "node-2");
    }

    #[tokio::test]
    async fn test_persistent_lock_reacquire_is_idempotent() {
        let cluster = MemoryCoordination::new();
        let lock = PersistentLock::new(cluster.connect(), "db-repair", "node-1");
        lock.acquire().await.unwrap();
        lock.acquire().await.unwrap();
        lock.release().await.unwrap();
        assert!(lock.owner().await.unwrap().is_none());
    }
}
