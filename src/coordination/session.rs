//! Coordination client
//!
//! One explicit [`CoordinationClient`] is constructed at process start and
//! passed by reference to every component that needs the coordination store.
//! There is no process-wide singleton.
//!
//! The client tracks every ephemeral announcement made through it and
//! re-creates them when the session reconnects, since ephemeral presence is
//! dropped by the store on session loss.

use crate::coordination::store::{ConnectionState, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Ephemeral node the client re-creates after a reconnect
#[derive(Debug, Clone)]
struct Announcement {
    path: String,
    data: Vec<u8>,
}

/// Session-scoped entry point to the coordination store
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    site_id: String,
    node_id: String,
    announcements: Mutex<Vec<Announcement>>,
}

impl CoordinationClient {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        site_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            site_id: site_id.into(),
            node_id: node_id.into(),
            announcements: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    /// Stream of CONNECTED/DISCONNECTED transitions, in order, at-least-once
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.store.subscribe_connection()
    }

    /// Create an ephemeral node and remember it for re-announcement
    pub async fn announce_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        match self
            .store
            .create_node(path, data, CreateMode::Ephemeral)
            .await
        {
            Ok(_) | Err(Error::NodeExists { .. }) => {
                let mut announcements = self.announcements.lock();
                announcements.retain(|a| a.path != path);
                announcements.push(Announcement {
                    path: path.to_string(),
                    data: data.to_vec(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-create every tracked ephemeral node, after a reconnect
    pub async fn reannounce(&self) -> Result<()> {
        let announcements = self.announcements.lock().clone();
        for announcement in announcements {
            match self
                .store
                .create_node(&announcement.path, &announcement.data, CreateMode::Ephemeral)
                .await
            {
                Ok(_) | Err(Error::NodeExists { .. }) => {}
                Err(e) => {
                    warn!(path = %announcement.path, error = %e, "re-announcement failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Background task: watch the connection stream and restore ephemeral
    /// presence each time the session comes back
    pub fn spawn_presence_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let client = self.clone();
        tokio::spawn(async move {
            let mut rx = client.subscribe_connection();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let state = *rx.borrow();
                        match state {
                            ConnectionState::Disconnected => {
                                warn!(node_id = %client.node_id, "coordination session disconnected");
                            }
                            // The watch channel coalesces, so a fast
                            // disconnect/reconnect can surface as a single
                            // Connected observation. Every Connected edge
                            // restores presence; reannounce is idempotent.
                            ConnectionState::Connected => {
                                info!(node_id = %client.node_id, "coordination session up, restoring ephemeral presence");
                                let policy = backoff::ExponentialBackoff {
                                    max_elapsed_time: Some(std::time::Duration::from_secs(30)),
                                    ..Default::default()
                                };
                                let attempt = backoff::future::retry(policy, || async {
                                    client.reannounce().await.map_err(|e| {
                                        if e.is_retryable() {
                                            backoff::Error::transient(e)
                                        } else {
                                            backoff::Error::permanent(e)
                                        }
                                    })
                                })
                                .await;
                                if let Err(e) = attempt {
                                    warn!(error = %e, "presence re-announcement failed, will retry on next transition");
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordination;

    #[tokio::test]
    async fn test_announce_and_reannounce() {
        let cluster = MemoryCoordination::new();
        let session = cluster.connect();
        let session_id = session.session_id();
        let client = CoordinationClient::new(session, "site-1", "node-1");

        client
            .announce_ephemeral("/service/syssvc/1/node-1", b"{}")
            .await
            .unwrap();

        // Session expiry drops the ephemeral node
        cluster.expire_session(session_id);
        cluster.restore_session(session_id);

        let observer = cluster.connect();
        assert!(observer
            .list_children("/service/syssvc/1")
            .await
            .unwrap()
            .is_empty());

        client.reannounce().await.unwrap();
        assert_eq!(
            observer.list_children("/service/syssvc/1").await.unwrap(),
            vec!["node-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_presence_task_restores_after_reconnect() {
        let cluster = MemoryCoordination::new();
        let session = cluster.connect();
        let session_id = session.session_id();
        let client = CoordinationClient::new(session, "site-1", "node-1");
        let shutdown = CancellationToken::new();
        client.spawn_presence_task(shutdown.clone());

        client
            .announce_ephemeral("/service/vdcmgr/1/node-1", b"{}")
            .await
            .unwrap();

        cluster.expire_session(session_id);
        cluster.restore_session(session_id);

        // Give the presence task a moment to observe both transitions
        let observer = cluster.connect();
        for _ in 0..50 {
            if !observer
                .list_children("/service/vdcmgr/1")
                .await
                .unwrap()
                .is_empty()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            observer.list_children("/service/vdcmgr/1").await.unwrap(),
            vec!["node-1".to_string()]
        );
        shutdown.cancel();
    }
}
