//! In-memory coordination store
//!
//! A complete in-process implementation of [`CoordinationStore`]: one shared
//! hierarchical tree, any number of sessions bound to it. Ephemeral nodes die
//! with their session, sequence numbers are monotonic across the whole tree,
//! and watch events are delivered in modification order.
//!
//! Standalone mode and every test in the crate run against this store;
//! production deployments substitute a ZooKeeper- or etcd-backed adapter.

use crate::coordination::store::{
    ConnectionState, CoordinationStore, CreateMode, WatchEvent, WatchEventKind,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

// =============================================================================
// Tree State
// =============================================================================

#[derive(Debug, Clone)]
struct NodeEntry {
    data: Vec<u8>,
    /// Session that owns this node, for ephemeral modes
    owner: Option<u64>,
}

struct SessionEntry {
    state: ConnectionState,
    conn_tx: watch::Sender<ConnectionState>,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, NodeEntry>,
    watches: HashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>,
    sessions: HashMap<u64, SessionEntry>,
    next_sequence: u64,
    next_session: u64,
}

impl TreeState {
    fn notify(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(subscribers) = self.watches.get_mut(path) {
            subscribers.retain(|tx| {
                tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                })
                .is_ok()
            });
        }
        // Parent watchers see the membership change
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() && !matches!(kind, WatchEventKind::DataChanged) {
                if let Some(subscribers) = self.watches.get_mut(parent) {
                    subscribers.retain(|tx| {
                        tx.send(WatchEvent {
                            path: parent.to_string(),
                            kind: WatchEventKind::ChildrenChanged,
                        })
                        .is_ok()
                    });
                }
            }
        }
    }

    fn remove_session_nodes(&mut self, session_id: u64) {
        let doomed: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in doomed {
            self.nodes.remove(&path);
            self.notify(&path, WatchEventKind::Deleted);
        }
    }
}

// =============================================================================
// Shared Cluster Handle
// =============================================================================

/// The shared in-memory tree all sessions attach to
#[derive(Clone)]
pub struct MemoryCoordination {
    state: Arc<Mutex<TreeState>>,
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TreeState::default())),
        }
    }

    /// Open a new session against the tree
    pub fn connect(&self) -> Arc<MemorySession> {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        let (conn_tx, conn_rx) = watch::channel(ConnectionState::Connected);
        state.sessions.insert(
            id,
            SessionEntry {
                state: ConnectionState::Connected,
                conn_tx,
            },
        );
        debug!(session_id = id, "coordination session opened");
        Arc::new(MemorySession {
            state: self.state.clone(),
            id,
            conn_rx,
        })
    }

    /// Simulate session expiry: drop the session's ephemeral nodes and
    /// deliver DISCONNECTED to its listeners
    pub fn expire_session(&self, session_id: u64) {
        let mut state = self.state.lock();
        state.remove_session_nodes(session_id);
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.state = ConnectionState::Disconnected;
            let _ = session.conn_tx.send(ConnectionState::Disconnected);
        }
        debug!(session_id, "coordination session expired");
    }

    /// Restore a previously expired session to CONNECTED
    pub fn restore_session(&self, session_id: u64) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.state = ConnectionState::Connected;
            let _ = session.conn_tx.send(ConnectionState::Connected);
        }
    }
}

// =============================================================================
// Session-Bound Store
// =============================================================================

/// One session's handle onto the shared tree
pub struct MemorySession {
    state: Arc<Mutex<TreeState>>,
    id: u64,
    conn_rx: watch::Receiver<ConnectionState>,
}

impl MemorySession {
    fn ensure_connected(&self, state: &TreeState) -> Result<()> {
        match state.sessions.get(&self.id).map(|s| s.state) {
            Some(ConnectionState::Connected) => Ok(()),
            _ => Err(Error::SessionLost),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn create_node(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;

        let final_path = if mode.is_sequential() {
            state.next_sequence += 1;
            format!("{}{:010}", path, state.next_sequence)
        } else {
            path.to_string()
        };

        if state.nodes.contains_key(&final_path) {
            return Err(Error::NodeExists { path: final_path });
        }

        let owner = mode.is_ephemeral().then_some(self.id);
        state.nodes.insert(
            final_path.clone(),
            NodeEntry {
                data: data.to_vec(),
                owner,
            },
        );
        state.notify(&final_path, WatchEventKind::Created);
        Ok(final_path)
    }

    async fn read_node(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        self.ensure_connected(&state)?;
        Ok(state.nodes.get(path).map(|entry| entry.data.clone()))
    }

    async fn write_node(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        match state.nodes.get_mut(path) {
            Some(entry) => {
                entry.data = data.to_vec();
                state.notify(path, WatchEventKind::DataChanged);
                Ok(())
            }
            None => Err(Error::NodeNotFound {
                path: path.to_string(),
            }),
        }
    }

    async fn delete_node(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        if state.nodes.remove(path).is_none() {
            return Err(Error::NodeNotFound {
                path: path.to_string(),
            });
        }
        state.notify(path, WatchEventKind::Deleted);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        self.ensure_connected(&state)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut children = BTreeSet::new();
        for key in state.nodes.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() {
                    children.insert(name.to_string());
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        let current = state.nodes.get(path).map(|entry| entry.data.clone());
        match (expected, current) {
            (None, None) => {
                state.nodes.insert(
                    path.to_string(),
                    NodeEntry {
                        data: new.to_vec(),
                        owner: None,
                    },
                );
                state.notify(path, WatchEventKind::Created);
                Ok(true)
            }
            (Some(want), Some(have)) if want == have.as_slice() => {
                if let Some(entry) = state.nodes.get_mut(path) {
                    entry.data = new.to_vec();
                }
                state.notify(path, WatchEventKind::DataChanged);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn watch(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watches.entry(path.to_string()).or_default().push(tx);
        Ok(rx)
    }

    fn session_id(&self) -> u64 {
        self.id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.conn_rx.borrow()
    }

    fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.conn_rx.clone()
    }
}
