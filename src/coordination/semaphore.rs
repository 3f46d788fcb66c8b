//! Distributed semaphore
//!
//! Bounds cluster-wide concurrency of expensive operations to N permits.
//! Waiters queue as sequential ephemeral children; a waiter holds a permit
//! once its sorted position is inside the permit count, so permits hand off
//! in arrival order as earlier holders release or die.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Distributed counting semaphore handle
pub struct DistributedSemaphore {
    store: Arc<dyn CoordinationStore>,
    name: String,
    owner_id: String,
    permits: u32,
    my_node: tokio::sync::Mutex<Option<String>>,
}

impl DistributedSemaphore {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
        permits: u32,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            owner_id: owner_id.into(),
            permits: permits.max(1),
            my_node: tokio::sync::Mutex::new(None),
        }
    }

    /// Acquire one permit, waiting up to `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        if my_node.is_some() {
            return Err(Error::Internal(format!(
                "semaphore {} handle already holds a permit",
                self.name
            )));
        }

        let started = Instant::now();
        let prefix = format!("{}/permit-", paths::semaphore(&self.name));
        let created = self
            .store
            .create_node(&prefix, self.owner_id.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        let my_seq = paths::sequence_of(&created).ok_or_else(|| {
            Error::Internal(format!("store returned non-sequential node {created}"))
        })?;

        loop {
            let children = self
                .store
                .list_children(&paths::semaphore(&self.name))
                .await?;
            let ahead = children
                .iter()
                .filter_map(|c| paths::sequence_of(c))
                .filter(|seq| *seq < my_seq)
                .count() as u32;
            if ahead < self.permits {
                debug!(semaphore = %self.name, owner = %self.owner_id, "permit acquired");
                *my_node = Some(created);
                return Ok(());
            }
            if started.elapsed() >= timeout {
                let _ = self.store.delete_node(&created).await;
                return Err(Error::Timeout {
                    operation: format!("acquire semaphore {}", self.name),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Return the held permit
    pub async fn release(&self) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        match my_node.take() {
            Some(node) => {
                self.store.delete_node(&node).await?;
                debug!(semaphore = %self.name, owner = %self.owner_id, "permit released");
                Ok(())
            }
            None => Err(Error::LockNotHeld {
                name: self.name.clone(),
            }),
        }
    }

    /// Number of permits currently handed out (or queued)
    pub async fn holders(&self) -> Result<u32> {
        let children = self
            .store
            .list_children(&paths::semaphore(&self.name))
            .await?;
        Ok((children.len() as u32).min(self.permits))
    }
}
