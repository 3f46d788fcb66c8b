//! Multi-Site Coordinator - Cluster Coordination and DR Orchestration
//!
//! Coordination core of a geo-distributed storage control plane: a
//! hierarchical watchable coordination store with distributed locks,
//! elections, barriers and queues built on top, a typed configuration
//! store, a service registry, and the site state machine that drives
//! multi-site disaster-recovery operations (standby lifecycle, switchover,
//! failover, data-revision changes) plus the cluster repair coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Site Manager (per node)                     │
//! │   target reconciliation · DR handlers · audit · power-off        │
//! ├──────────────────────────┬──────────────────────────────────────┤
//! │   Config Store (typed)   │     Service Registry    │  Repair    │
//! │   global / per-site      │   ephemeral + cached    │ Coordinator│
//! ├──────────────────────────┴──────────────────────────────────────┤
//! │  Coordination Primitives: locks · rwlock · semaphore · election  │
//! │                 barriers · queues · work pool                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   Coordination Store: hierarchical namespace, ephemerals,        │
//! │   sequentials, watches, per-key CAS, session tracking            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`coordination`]: store trait, in-memory store, client, primitives
//! - [`config`]: typed configuration records and store, cluster health
//! - [`registry`]: service registration and endpoint discovery
//! - [`domain`]: ports onto the systems the coordinator drives
//! - [`sitemgr`]: site state machine, DR handlers, control loop
//! - [`repair`]: cluster anti-entropy repair coordination
//! - [`error`]: error types and recovery classification

pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod registry;
pub mod repair;
pub mod sitemgr;

// Re-export commonly used types
pub use coordination::{
    ConnectionState, CoordinationClient, CoordinationStore, CreateMode, DistributedBarrier,
    DistributedDoubleBarrier, DistributedLock, DistributedQueue, DistributedReadWriteLock,
    DistributedSemaphore, LeaderElector, MemoryCoordination, PersistentLock, WatchEvent,
    WatchEventKind, WorkPool,
};

pub use config::{
    ClusterState, ConfigKind, ConfigRecord, ConfigScope, ConfigStore, DrOperationStatus,
    PowerOffState, PrimarySitePointer, RepositoryInfo, Site, SiteError, SiteInfo, SiteState,
    TargetInfo,
};

pub use domain::{
    AuditLog, AuditStatus, ClusterMembership, LocalRepository, RepairExecutor, SiteControlClient,
};

pub use error::{Error, RecoveryAction, Result};

pub use registry::{AddressFamily, ServiceRecord, ServiceRegistry};

pub use repair::{RepairCoordinator, RepairCoordinatorConfig, RepairJobState};

pub use sitemgr::{HandlerRegistry, OperationHandler, VdcManager, VdcManagerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
