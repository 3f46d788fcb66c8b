//! Distributed read/write lock
//!
//! Readers and writers queue as sequential ephemeral children under a shared
//! path. A reader proceeds once no earlier-queued writer survives; a writer
//! proceeds once it is the earliest surviving child of any kind. Writers are
//! therefore never starved by late-arriving readers.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn rwlock_path(name: &str) -> String {
    format!("/locks/rw/{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Writer,
}

/// Distributed reader/writer lock handle
pub struct DistributedReadWriteLock {
    store: Arc<dyn CoordinationStore>,
    name: String,
    owner_id: String,
    my_node: tokio::sync::Mutex<Option<(String, Role)>>,
}

impl DistributedReadWriteLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            owner_id: owner_id.into(),
            my_node: tokio::sync::Mutex::new(None),
        }
    }

    /// Acquire in shared (read) mode
    pub async fn acquire_read(&self, timeout: Duration) -> Result<()> {
        self.acquire(Role::Reader, timeout).await
    }

    /// Acquire in exclusive (write) mode
    pub async fn acquire_write(&self, timeout: Duration) -> Result<()> {
        self.acquire(Role::Writer, timeout).await
    }

    async fn acquire(&self, role: Role, timeout: Duration) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        if my_node.is_some() {
            return Err(Error::Internal(format!(
                "rwlock {} handle already holds a queue position",
                self.name
            )));
        }

        let started = Instant::now();
        let prefix = match role {
            Role::Reader => format!("{}/read-", rwlock_path(&self.name)),
            Role::Writer => format!("{}/write-", rwlock_path(&self.name)),
        };
        let created = self
            .store
            .create_node(&prefix, self.owner_id.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        let my_name = created.rsplit('/').next().unwrap_or(&created).to_string();
        let my_seq = paths::sequence_of(&my_name).ok_or_else(|| Error::Internal(
            format!("store returned non-sequential node {created}"),
        ))?;

        loop {
            let children = self.store.list_children(&rwlock_path(&self.name)).await?;
            let granted = match role {
                // Readers wait only on earlier writers
                Role::Reader => children
                    .iter()
                    .filter(|c| c.starts_with("write-"))
                    .filter_map(|c| paths::sequence_of(c))
                    .all(|seq| seq >= my_seq),
                // Writers wait on everything queued before them
                Role::Writer => children
                    .iter()
                    .filter_map(|c| paths::sequence_of(c))
                    .all(|seq| seq >= my_seq),
            };
            if granted {
                debug!(rwlock = %self.name, owner = %self.owner_id, ?role, "rwlock acquired");
                *my_node = Some((created, role));
                return Ok(());
            }
            if started.elapsed() >= timeout {
                let _ = self.store.delete_node(&created).await;
                return Err(Error::Timeout {
                    operation: format!("acquire rwlock {} ({:?})", self.name, role),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release whatever mode this handle holds
    pub async fn release(&self) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        match my_node.take() {
            Some((node, role)) => {
                self.store.delete_node(&node).await?;
                debug!(rwlock = %self.name, owner = %self.owner_id, ?role, "rwlock released");
                Ok(())
            }
            None => Err(Error::LockNotHeld {
                name: self.name.clone(),
            }),
        }
    }
}
