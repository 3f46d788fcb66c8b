//! Coordination store contract
//!
//! The hierarchical, watchable namespace every primitive is built on.
//! Any backing store offering linearizable single-key writes, ordered
//! ephemeral sequential children, and change notifications satisfies this
//! contract; the crate ships an in-memory implementation, a
//! ZooKeeper/etcd-backed adapter plugs in externally.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// Node Creation Modes
// =============================================================================

/// How a node is created and how long it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateMode {
    /// Survives session loss
    Persistent,
    /// Removed automatically when the creating session dies
    Ephemeral,
    /// Persistent with a store-assigned monotonic suffix
    PersistentSequential,
    /// Ephemeral with a store-assigned monotonic suffix
    EphemeralSequential,
}

impl CreateMode {
    /// Whether nodes created in this mode die with their session
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential
        )
    }

    /// Whether the store appends a sequence suffix to the node name
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

// =============================================================================
// Watch Events
// =============================================================================

/// Change notification for a watched node
///
/// Delivered at-least-once and in the order the underlying data changed.
/// Delivery can be missed across a disconnect; callers must re-read state
/// on reconnect and never rely on watch delivery alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Path the watch was registered on
    pub path: String,
    /// What happened
    pub kind: WatchEventKind,
}

/// Kind of change observed on a watched node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    DataChanged,
    Deleted,
    ChildrenChanged,
}

// =============================================================================
// Connection State
// =============================================================================

/// Liveness of a coordination session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Port for the hierarchical coordination namespace
///
/// A handle is bound to one live session; ephemeral nodes created through it
/// are removed when that session ends. On session loss every in-flight lock
/// or barrier handle built on this store must assume it lost exclusivity.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node, returning its final path (sequential modes append a
    /// zero-padded counter to the requested name)
    async fn create_node(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Read a node's payload
    async fn read_node(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite a node's payload
    async fn write_node(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a node; succeeds only against the exact surviving node
    async fn delete_node(&self, path: &str) -> Result<()>;

    /// List direct child names (not full paths) of a node
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Atomically replace a node's payload if it currently matches `expected`
    /// (`None` = node must not exist). Returns false on mismatch.
    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool>;

    /// Subscribe to changes of a node and its direct children
    async fn watch(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    /// Identifier of the session this handle is bound to
    fn session_id(&self) -> u64;

    /// Current connection state of the session
    fn connection_state(&self) -> ConnectionState;

    /// Stream of connection-state transitions, delivered in order. The
    /// control loop selects on this instead of registering callbacks.
    fn subscribe_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState>;
}

// =============================================================================
// Path Helpers
// =============================================================================

/// Well-known namespace roots
pub mod paths {
    /// Extract the sequence number from a sequential node name
    /// (e.g. `lock-0000000007` -> 7)
    pub fn sequence_of(name: &str) -> Option<u64> {
        name.rsplit('-').next()?.parse().ok()
    }

    pub fn lock(name: &str) -> String {
        format!("/locks/{name}")
    }

    pub fn persistent_lock(name: &str) -> String {
        format!("/locks/persistent/{name}")
    }

    pub fn election(name: &str) -> String {
        format!("/elections/{name}")
    }

    pub fn barrier(name: &str) -> String {
        format!("/barrier/{name}")
    }

    pub fn semaphore(name: &str) -> String {
        format!("/semaphores/{name}")
    }

    pub fn queue(name: &str) -> String {
        format!("/queues/{name}")
    }

    pub fn service(name: &str, version: &str) -> String {
        format!("/service/{name}/{version}")
    }

    pub fn global_config(kind: &str, id: &str) -> String {
        format!("/config/{kind}/{id}")
    }

    pub fn site_config(site_id: &str, kind: &str, id: &str) -> String {
        format!("/sites/{site_id}/config/{kind}/{id}")
    }
}
