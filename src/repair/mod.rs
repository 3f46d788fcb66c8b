//! Cluster anti-entropy repair coordination

pub mod coordinator;
pub mod state;

pub use coordinator::{RepairCoordinator, RepairCoordinatorConfig};
pub use state::{RepairJobState, RepairStatus};
