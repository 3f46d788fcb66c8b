//! Core domain contracts

pub mod ports;

pub use ports::{
    AuditEntry, AuditLog, AuditLogRef, AuditStatus, ClusterMembership, ClusterMembershipRef,
    LocalRepository, LocalRepositoryRef, LoopbackSiteControl, MemoryAuditLog, RepairExecutor,
    RepairExecutorRef, SiteControlClient, SiteControlClientRef, StandaloneMembership,
    StandaloneRepairExecutor, StandaloneRepository,
};
