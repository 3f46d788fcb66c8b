//! Leader election
//!
//! Each candidate announces a sequential ephemeral node; the lowest-numbered
//! live candidate is leader. When the leader's session expires or it
//! relinquishes explicitly, the next candidate in line is promoted without
//! any further coordination. Used to pick a single driver for long-running
//! jobs without a dedicated lock.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One node's participation in a named election
pub struct LeaderElector {
    store: Arc<dyn CoordinationStore>,
    name: String,
    candidate_id: String,
    my_node: tokio::sync::Mutex<Option<String>>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        candidate_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            candidate_id: candidate_id.into(),
            my_node: tokio::sync::Mutex::new(None),
        }
    }

    /// Join the election as a candidate. Idempotent.
    pub async fn announce(&self) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        if my_node.is_some() {
            return Ok(());
        }
        let prefix = format!("{}/candidate-", paths::election(&self.name));
        let created = self
            .store
            .create_node(
                &prefix,
                self.candidate_id.as_bytes(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        debug!(election = %self.name, candidate = %self.candidate_id, node = %created, "candidacy announced");
        *my_node = Some(created);
        Ok(())
    }

    /// Whether this candidate currently leads
    pub async fn is_leader(&self) -> Result<bool> {
        let my_node = self.my_node.lock().await;
        let mine = match my_node.as_deref() {
            Some(node) => node,
            None => return Ok(false),
        };
        let my_seq = paths::sequence_of(mine)
            .ok_or_else(|| Error::Internal(format!("non-sequential candidate node {mine}")))?;
        let children = self.store.list_children(&paths::election(&self.name)).await?;
        Ok(children
            .iter()
            .filter_map(|c| paths::sequence_of(c))
            .all(|seq| seq >= my_seq))
    }

    /// Block until this candidate is promoted, up to `timeout`. Candidacy is
    /// kept on timeout; the caller stays in line.
    pub async fn await_leadership(&self, timeout: Duration) -> Result<()> {
        self.announce().await?;
        let started = Instant::now();
        loop {
            if self.is_leader().await? {
                info!(election = %self.name, candidate = %self.candidate_id, "leadership acquired");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: format!("await leadership of {}", self.name),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Identifier of the current leader, if any candidate is registered
    pub async fn leader_id(&self) -> Result<Option<String>> {
        let base = paths::election(&self.name);
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

    /// Step out of the election, promoting the next candidate
    pub async fn relinquish(&self) -> Result<()> {
        let mut my_node = self.my_node.lock().await;
        if let Some(node) = my_node.take() {
            match self.store.delete_node(&node).await {
                Ok(()) | Err(Error::NodeNotFound { .. }) => {
                    info!(election = %self.name, candidate = %self.candidate_id, "leadership relinquished");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordination;

    #[tokio::test]
    async fn test_lowest_candidate_leads() {
        let cluster = MemoryCoordination::new();
        let first = LeaderElector::new(cluster.connect(), "vdc-driver", "node-1");
        let second = LeaderElector::new(cluster.connect(), "vdc-driver", "node-2");

        first.announce().await.unwrap();
        second.announce().await.unwrap();

        assert!(first.is_leader().await.unwrap());
        assert!(!second.is_leader().await.unwrap());
        assert_eq!(
            second.leader_id().await.unwrap(),
            Some("node-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_next_candidate_promoted_on_relinquish() {
        let cluster = MemoryCoordination::new();
        let first = LeaderElector::new(cluster.connect(), "vdc-driver", "node-1");
        let second = LeaderElector::new(cluster.connect(), "vdc-driver", "node-2");

        first.await_leadership(Duration::from_secs(1)).await.unwrap();
        second.announce().await.unwrap();

        first.relinquish().await.unwrap();
        second.await_leadership(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.leader_id().await.unwrap(), Some("node-2".to_string()));
    }

    #[tokio::test]
    async fn test_promotion_on_session_expiry() {
        let cluster = MemoryCoordination::new();
        let leader_session = cluster.connect();
        let leader_id = leader_session.session_id();
        let leader = LeaderElector::new(leader_session, "vdc-driver", "node-1");
        leader.await_leadership(Duration::from_secs(1)).await.unwrap();

        let follower = LeaderElector::new(cluster.connect(), "vdc-driver", "node-2");
        follower.announce().await.unwrap();
        assert!(!follower.is_leader().await.unwrap());

        cluster.expire_session(leader_id);
        follower.await_leadership(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_await_leadership_timeout_keeps_candidacy() {
        let cluster = MemoryCoordination::new();
        let leader = LeaderElector::new(cluster.connect(), "vdc-driver", "node-1");
        leader.await_leadership(Duration::from_secs(1)).await.unwrap();

        let follower = LeaderElector::new(cluster.connect(), "vdc-driver", "node-2");
        let err = follower
            .await_leadership(Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // Still in line: promoted as soon as the leader steps down
        leader.relinquish().await.unwrap();
        follower.await_leadership(Duration::from_secs(1)).await.unwrap();
    }
}
