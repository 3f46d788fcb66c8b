//! Domain Ports - collaborator contracts for the coordination core
//!
//! These traits define the boundaries between the coordination core and the
//! systems it drives: the local software repository, the audit sink, the
//! per-site control endpoint, the storage cluster's membership layer, and
//! the anti-entropy repair executor. Real adapters live outside this crate;
//! the standalone implementations below back `--standalone` mode and tests.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Local Repository Port
// =============================================================================

/// Port onto the node-local software repository
#[async_trait]
pub trait LocalRepository: Send + Sync {
    /// Set a local configuration property
    async fn set_property(&self, key: &str, value: &str) -> Result<()>;

    /// Read a local configuration property
    async fn get_property(&self, key: &str) -> Result<Option<String>>;

    /// Regenerate a service's configuration from current properties
    async fn reconfigure_service(&self, name: &str) -> Result<()>;

    /// Restart a service
    async fn restart_service(&self, name: &str) -> Result<()>;

    /// Stop a service
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// Reboot this node
    async fn reboot(&self) -> Result<()>;

    /// Power this node off
    async fn power_off(&self) -> Result<()>;
}

// =============================================================================
// Audit Log Port
// =============================================================================

/// Outcome recorded with an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStatus::Success => write!(f, "success"),
            AuditStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Port onto the audit-log sink
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        event_type: &str,
        status: AuditStatus,
        site_id: &str,
        message: &str,
    ) -> Result<()>;
}

// =============================================================================
// Site Control Port
// =============================================================================

/// Port onto a remote site's internal control endpoint
#[async_trait]
pub trait SiteControlClient: Send + Sync {
    /// Ask every node of the site to power off
    async fn power_off(&self, site_id: &str) -> Result<()>;

    /// Block the site at the network layer
    async fn block_site(&self, site_id: &str) -> Result<()>;

    /// Lift a network-layer block
    async fn unblock_site(&self, site_id: &str) -> Result<()>;
}

// =============================================================================
// Cluster Membership Port
// =============================================================================

/// Port onto the storage cluster's gossip/membership layer
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Node ids currently visible in the gossip ring
    async fn live_nodes(&self) -> Result<Vec<String>>;

    /// Evict every storage node belonging to a site from the ring
    async fn evict_site(&self, site_id: &str) -> Result<()>;

    /// Replace the replication strategy options with the given site set
    async fn update_strategy_options(&self, sites: Vec<String>) -> Result<()>;

    /// Sites currently present in the strategy options
    async fn strategy_options(&self) -> Result<Vec<String>>;
}

// =============================================================================
// Repair Executor Port
// =============================================================================

/// Port onto the storage engine's anti-entropy repair
#[async_trait]
pub trait RepairExecutor: Send + Sync {
    /// Number of token ranges one full repair covers
    fn range_count(&self) -> u32;

    /// Repair a single token range
    async fn repair_range(&self, token: u32) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type LocalRepositoryRef = Arc<dyn LocalRepository>;
pub type AuditLogRef = Arc<dyn AuditLog>;
pub type SiteControlClientRef = Arc<dyn SiteControlClient>;
pub type ClusterMembershipRef = Arc<dyn ClusterMembership>;
pub type RepairExecutorRef = Arc<dyn RepairExecutor>;

// =============================================================================
// Standalone Implementations
// =============================================================================

/// In-process repository used by standalone mode and tests; records every
/// action it is asked to perform
#[derive(Default)]
pub struct StandaloneRepository {
    properties: Mutex<BTreeMap<String, String>>,
    actions: Mutex<Vec<String>>,
}

impl StandaloneRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Chronological log of service/reboot actions
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().get(key).cloned()
    }
}

#[async_trait]
impl LocalRepository for StandaloneRepository {
    async fn set_property(&self, key: &str, value: &str) -> Result<()> {
        self.properties.lock().insert(key.into(), value.into());
        Ok(())
    }

    async fn get_property(&self, key: &str) -> Result<Option<String>> {
        Ok(self.properties.lock().get(key).cloned())
    }

    async fn reconfigure_service(&self, name: &str) -> Result<()> {
        self.actions.lock().push(format!("reconfigure:{name}"));
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        self.actions.lock().push(format!("restart:{name}"));
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.actions.lock().push(format!("stop:{name}"));
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.actions.lock().push("reboot".into());
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        self.actions.lock().push("poweroff".into());
        Ok(())
    }
}

/// One recorded audit entry
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub event_type: String,
    pub status: AuditStatus,
    pub site_id: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// In-memory audit sink
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(
        &self,
        event_type: &str,
        status: AuditStatus,
        site_id: &str,
        message: &str,
    ) -> Result<()> {
        self.entries.lock().push(AuditEntry {
            event_type: event_type.into(),
            status,
            site_id: site_id.into(),
            message: message.into(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }
}

/// In-process site control endpoint; tracks blocked and powered-off sites
#[derive(Default)]
pub struct LoopbackSiteControl {
    blocked: Mutex<Vec<String>>,
    powered_off: Mutex<Vec<String>>,
}

impl LoopbackSiteControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn blocked(&self) -> Vec<String> {
        self.blocked.lock().clone()
    }

    pub fn powered_off(&self) -> Vec<String> {
        self.powered_off.lock().clone()
    }
}

#[async_trait]
impl SiteControlClient for LoopbackSiteControl {
    async fn power_off(&self, site_id: &str) -> Result<()> {
        let mut powered_off = self.powered_off.lock();
        if !powered_off.iter().any(|s| s == site_id) {
            powered_off.push(site_id.into());
        }
        Ok(())
    }

    async fn block_site(&self, site_id: &str) -> Result<()> {
        let mut blocked = self.blocked.lock();
        if !blocked.iter().any(|s| s == site_id) {
            blocked.push(site_id.into());
        }
        Ok(())
    }

    async fn unblock_site(&self, site_id: &str) -> Result<()> {
        self.blocked.lock().retain(|s| s != site_id);
        Ok(())
    }
}

/// In-process membership layer keyed by `<site>/<node>` ids
#[derive(Default)]
pub struct StandaloneMembership {
    nodes: Mutex<Vec<String>>,
    strategy: Mutex<Vec<String>>,
}

impl StandaloneMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_nodes(nodes: &[&str]) -> Arc<Self> {
        let membership = Self::default();
        *membership.nodes.lock() = nodes.iter().map(|n| n.to_string()).collect();
        Arc::new(membership)
    }
}

#[async_trait]
impl ClusterMembership for StandaloneMembership {
    async fn live_nodes(&self) -> Result<Vec<String>> {
        Ok(self.nodes.lock().clone())
    }

    async fn evict_site(&self, site_id: &str) -> Result<()> {
        let prefix = format!("{site_id}/");
        self.nodes.lock().retain(|n| !n.starts_with(&prefix));
        Ok(())
    }

    async fn update_strategy_options(&self, sites: Vec<String>) -> Result<()> {
        *self.strategy.lock() = sites;
        Ok(())
    }

    async fn strategy_options(&self) -> Result<Vec<String>> {
        Ok(self.strategy.lock().clone())
    }
}

/// Repair executor that completes every range without touching anything
pub struct StandaloneRepairExecutor {
    ranges: u32,
    repaired: Mutex<Vec<u32>>,
}

impl StandaloneRepairExecutor {
    pub fn new(ranges: u32) -> Arc<Self> {
        Arc::new(Self {
            ranges,
            repaired: Mutex::new(Vec::new()),
        })
    }

    pub fn repaired(&self) -> Vec<u32> {
        self.repaired.lock().clone()
    }
}

#[async_trait]
impl RepairExecutor for StandaloneRepairExecutor {
    fn range_count(&self) -> u32 {
        self.ranges
    }

    async fn repair_range(&self, token: u32) -> Result<()> {
        self.repaired.lock().push(token);
        Ok(())
    }
}
