//! Configuration store and typed records
//!
//! Desired state written by the operator-facing API, observed state
//! published per node, and the DR tracking records the site state machine
//! maintains. Cluster health is derived from these, never stored.

pub mod health;
pub mod records;
pub mod store;

pub use health::{derive_cluster_state, ClusterState};
pub use records::{
    ConfigKind, ConfigRecord, ConfigScope, DrOperationStatus, PowerOffState, PrimarySitePointer,
    RepositoryInfo, Site, SiteError, SiteInfo, SiteState, TargetInfo,
};
pub use store::ConfigStore;
