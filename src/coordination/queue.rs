//! Distributed work queue and worker pool
//!
//! [`DistributedQueue`] is a persisted FIFO of serialized work items:
//! producers append persistent sequential children, consumers claim the
//! lowest-numbered item by deleting it, so an item survives the producer's
//! session and is dispatched to exactly one consumer.
//!
//! [`WorkPool`] drains a queue with a bounded set of workers, decoupling
//! background task execution from the requester's session.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(50);

// =============================================================================
// Distributed Queue
// =============================================================================

/// Persisted FIFO of opaque work items
pub struct DistributedQueue {
    store: Arc<dyn CoordinationStore>,
    name: String,
}

impl DistributedQueue {
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Append an item to the tail
    pub async fn offer(&self, item: &[u8]) -> Result<()> {
        let prefix = format!("{}/item-", paths::queue(&self.name));
        let created = self
            .store
            .create_node(&prefix, item, CreateMode::PersistentSequential)
            .await?;
        debug!(queue = %self.name, node = %created, "item offered");
        Ok(())
    }

    /// Claim and remove the head item. Claiming is delete-based, so two
    /// concurrent consumers never receive the same item.
    pub async fn poll(&self) -> Result<Option<Vec<u8>>> {
        let base = paths::queue(&self.name);
        loop {
            let mut children: Vec<String> = self
                .store
                .list_children(&base)
                .await?
                .into_iter()
                .filter(|c| paths::sequence_of(c).is_some())
                .collect();
            children.sort_by_key(|c| paths::sequence_of(c));

            let Some(head) = children.first() else {
                return Ok(None);
            };
            let path = format!("{base}/{head}");
            let Some(data) = self.store.read_node(&path).await? else {
                continue; // another consumer claimed it between list and read
            };
            match self.store.delete_node(&path).await {
                Ok(()) => return Ok(Some(data)),
                Err(Error::NodeNotFound { .. }) => continue, // lost the claim race
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the head item without claiming it
    pub async fn peek(&self) -> Result<Option<Vec<u8>>> {
        let base = paths::queue(&self.name);
        let mut children: Vec<String> = self
            .store
            .list_children(&base)
            .await?
            .into_iter()
            .filter(|c| paths::sequence_of(c).is_some())
            .collect();
        children.sort_by_key(|c| paths::sequence_of(c));
        match children.first() {
            Some(head) => self.store.read_node(&format!("{base}/{head}")).await,
            None => Ok(None),
        }
    }

    /// Number of queued items
    pub async fn len(&self) -> Result<usize> {
        Ok(self
            .store
            .list_children(&paths::queue(&self.name))
            .await?
            .len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

// =============================================================================
// Work Pool
// =============================================================================

/// Consumer callback for queued items
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn process(&self, item: Vec<u8>) -> Result<()>;
}

/// Bounded worker set draining a [`DistributedQueue`]
pub struct WorkPool {
    queue: Arc<DistributedQueue>,
    handler: Arc<dyn WorkHandler>,
    workers: usize,
}

impl WorkPool {
    pub fn new(queue: Arc<DistributedQueue>, handler: Arc<dyn WorkHandler>, workers: usize) -> Self {
        Self {
            queue,
            handler,
            workers: workers.max(1),
        }
    }

    /// Start the workers; they run until `shutdown` is cancelled
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if shutdown.is_cancelled() {
                            return;
                        }
                        match queue.poll().await {
                            Ok(Some(item)) => {
                                if let Err(e) = handler.process(item).await {
                                    error!(queue = %queue.name, worker, error = %e, "work item failed");
                                }
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = shutdown.cancelled() => return,
                                    _ = tokio::time::sleep(DRAIN_IDLE_SLEEP) => {}
                                }
                            }
                            Err(e) => {
                                error!(queue = %queue.name, worker, error = %e, "queue poll failed");
                                tokio::select! {
                                    _ = shutdown.cancelled() => return,
                                    _ = tokio::time::sleep(DRAIN_IDLE_SLEEP) => {}
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
