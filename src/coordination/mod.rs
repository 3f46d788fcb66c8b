//! Cluster coordination
//!
//! Session management and the distributed primitives every DR transition is
//! built from: locks, read/write locks, semaphores, leader election,
//! single and double barriers, and a persisted work queue. All of them sit
//! on the [`store::CoordinationStore`] contract, so any backing store with
//! linearizable single-key writes, ordered sequential children, and change
//! notifications can host them.

pub mod barrier;
pub mod election;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod rwlock;
pub mod semaphore;
pub mod session;
pub mod store;

pub use barrier::{DistributedBarrier, DistributedDoubleBarrier};
pub use election::LeaderElector;
pub use lock::{DistributedLock, PersistentLock, PersistentLockRecord};
pub use memory::{MemoryCoordination, MemorySession};
pub use queue::{DistributedQueue, WorkHandler, WorkPool};
pub use rwlock::DistributedReadWriteLock;
pub use semaphore::DistributedSemaphore;
pub use session::CoordinationClient;
pub use store::{ConnectionState, CoordinationStore, CreateMode, WatchEvent, WatchEventKind};
