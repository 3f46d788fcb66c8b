//! Configuration records
//!
//! Typed records persisted through the configuration store. Desired state
//! (TargetInfo, SiteInfo) is written by the operator-facing API; observed
//! state (RepositoryInfo) is published per node; Site and the DR tracking
//! records are mutated only by the site state machine while the relevant
//! distributed lock is held.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// =============================================================================
// Kinds and Scoping
// =============================================================================

/// Record kinds, with a static global-vs-site scope classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    Site,
    SiteInfo,
    TargetInfo,
    RepositoryInfo,
    DrOperationStatus,
    PrimarySitePointer,
    RepairJobState,
}

/// Namespace a kind is persisted under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// `/config/<kind>/<id>` - one copy cluster-wide
    Global,
    /// `/sites/<site>/config/<kind>/<id>` - one copy per site
    Site,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::Site => "site",
            ConfigKind::SiteInfo => "siteinfo",
            ConfigKind::TargetInfo => "targetinfo",
            ConfigKind::RepositoryInfo => "repositoryinfo",
            ConfigKind::DrOperationStatus => "droperationstatus",
            ConfigKind::PrimarySitePointer => "siteprimaryptr",
            ConfigKind::RepairJobState => "repairjobstate",
        }
    }

    /// Static classification table deciding where each kind lives
    pub fn scope(&self) -> ConfigScope {
        match self {
            // Cluster-wide facts
            ConfigKind::Site
            | ConfigKind::TargetInfo
            | ConfigKind::DrOperationStatus
            | ConfigKind::PrimarySitePointer
            | ConfigKind::RepairJobState => ConfigScope::Global,
            // Per-site topology and per-node observations
            ConfigKind::SiteInfo | ConfigKind::RepositoryInfo => ConfigScope::Site,
        }
    }
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record the configuration store can persist and query
pub trait ConfigRecord: Serialize + DeserializeOwned + Send + Sync {
    const KIND: ConfigKind;

    fn record_id(&self) -> String;
}

// =============================================================================
// Site State
// =============================================================================

/// DR state machine states for a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteState {
    Active,
    ActiveSwitchingOver,
    ActiveFailingOver,
    StandbySyncing,
    StandbySynced,
    StandbySwitchingOver,
    StandbyFailingOver,
    StandbyAdding,
    StandbyPausing,
    StandbyPaused,
    StandbyResuming,
    StandbyRemoving,
    StandbyError,
}

impl SiteState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SiteState::Active | SiteState::ActiveSwitchingOver | SiteState::ActiveFailingOver
        )
    }

    pub fn is_standby(&self) -> bool {
        !self.is_active()
    }

    /// States that represent an in-flight DR operation and are therefore
    /// subject to the per-operation timeout scan
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            SiteState::ActiveSwitchingOver
                | SiteState::ActiveFailingOver
                | SiteState::StandbySyncing
                | SiteState::StandbySwitchingOver
                | SiteState::StandbyFailingOver
                | SiteState::StandbyAdding
                | SiteState::StandbyPausing
                | SiteState::StandbyResuming
                | SiteState::StandbyRemoving
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SiteState::StandbyError)
    }
}

impl std::fmt::Display for SiteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SiteState::Active => "ACTIVE",
            SiteState::ActiveSwitchingOver => "ACTIVE_SWITCHING_OVER",
            SiteState::ActiveFailingOver => "ACTIVE_FAILING_OVER",
            SiteState::StandbySyncing => "STANDBY_SYNCING",
            SiteState::StandbySynced => "STANDBY_SYNCED",
            SiteState::StandbySwitchingOver => "STANDBY_SWITCHING_OVER",
            SiteState::StandbyFailingOver => "STANDBY_FAILING_OVER",
            SiteState::StandbyAdding => "STANDBY_ADDING",
            SiteState::StandbyPausing => "STANDBY_PAUSING",
            SiteState::StandbyPaused => "STANDBY_PAUSED",
            SiteState::StandbyResuming => "STANDBY_RESUMING",
            SiteState::StandbyRemoving => "STANDBY_REMOVING",
            SiteState::StandbyError => "STANDBY_ERROR",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Structured Site Error
// =============================================================================

/// User-facing cause recorded when a site enters STANDBY_ERROR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteError {
    /// DR operation that failed
    pub operation: String,
    /// Human-readable cause
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SiteError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// Site
// =============================================================================

/// One geographically distributed site participating in replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub uuid: Uuid,
    /// Stable identifier used in paths and lookups
    pub site_id: String,
    pub state: SiteState,
    pub node_count: u32,
    pub vip: String,
    pub last_state_update: DateTime<Utc>,
    /// Set while the site is in STANDBY_ERROR
    pub error: Option<SiteError>,
}

impl Site {
    pub fn new(site_id: impl Into<String>, vip: impl Into<String>, node_count: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            site_id: site_id.into(),
            state: SiteState::StandbyAdding,
            node_count,
            vip: vip.into(),
            last_state_update: Utc::now(),
            error: None,
        }
    }

    /// Transition state, refreshing the update timestamp and clearing any
    /// stale error when leaving STANDBY_ERROR
    pub fn transition(&mut self, next: SiteState) {
        self.state = next;
        self.last_state_update = Utc::now();
        if !next.is_error() {
            self.error = None;
        }
    }

    /// Force the site into STANDBY_ERROR with a structured cause
    pub fn fail(&mut self, error: SiteError) {
        self.state = SiteState::StandbyError;
        self.last_state_update = Utc::now();
        self.error = Some(error);
    }
}

impl ConfigRecord for Site {
    const KIND: ConfigKind = ConfigKind::Site;

    fn record_id(&self) -> String {
        self.site_id.clone()
    }
}

// =============================================================================
// Desired State
// =============================================================================

/// Graceful power-off request carried in the target configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerOffState {
    #[default]
    None,
    Graceful,
    Forced,
}

/// Desired cluster-wide property set, versioned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Monotonic version; a node whose local version lags runs the action
    pub config_version: u64,
    pub software_version: String,
    /// Cluster-wide data revision marker
    pub data_revision: u64,
    /// Operation handler to run when versions diverge (e.g. "add-standby")
    pub action: Option<String>,
    /// Site the action applies to, where relevant
    pub target_site: Option<String>,
    pub power_off: PowerOffState,
    pub properties: BTreeMap<String, String>,
}

impl TargetInfo {
    pub const ID: &'static str = "global";

    pub fn initial(software_version: impl Into<String>) -> Self {
        Self {
            config_version: 1,
            software_version: software_version.into(),
            data_revision: 0,
            action: None,
            target_site: None,
            power_off: PowerOffState::None,
            properties: BTreeMap::new(),
        }
    }

    /// Bump the version and set the action to run
    pub fn request(&mut self, action: impl Into<String>, target_site: Option<String>) {
        self.config_version += 1;
        self.action = Some(action.into());
        self.target_site = target_site;
    }
}

impl ConfigRecord for TargetInfo {
    const KIND: ConfigKind = ConfigKind::TargetInfo;

    fn record_id(&self) -> String {
        Self::ID.to_string()
    }
}

/// Per-site topology description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteInfo {
    pub site_id: String,
    pub vip: String,
    pub node_addresses: Vec<String>,
}

impl ConfigRecord for SiteInfo {
    const KIND: ConfigKind = ConfigKind::SiteInfo;

    fn record_id(&self) -> String {
        self.site_id.clone()
    }
}

// =============================================================================
// Observed State
// =============================================================================

/// Per-node observed configuration, published periodically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub node_id: String,
    pub site_id: String,
    pub software_version: String,
    pub config_version: u64,
    pub data_revision: u64,
    pub published_at: DateTime<Utc>,
}

impl ConfigRecord for RepositoryInfo {
    const KIND: ConfigKind = ConfigKind::RepositoryInfo;

    fn record_id(&self) -> String {
        self.node_id.clone()
    }
}

// =============================================================================
// DR Tracking Records
// =============================================================================

/// Progress record for an in-flight DR operation, kept until audited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrOperationStatus {
    pub site_id: String,
    pub operation: String,
    /// State the site holds while the operation is in flight
    pub interim_state: SiteState,
    pub started_at: DateTime<Utc>,
}

impl ConfigRecord for DrOperationStatus {
    const KIND: ConfigKind = ConfigKind::DrOperationStatus;

    fn record_id(&self) -> String {
        self.site_id.clone()
    }
}

/// Cluster-wide pointer to the active site. Exactly one exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimarySitePointer {
    pub site_id: String,
    pub updated_at: DateTime<Utc>,
}

impl PrimarySitePointer {
    pub const ID: &'static str = "primary";

    pub fn pointing_at(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            updated_at: Utc::now(),
        }
    }
}

impl ConfigRecord for PrimarySitePointer {
    const KIND: ConfigKind = ConfigKind::PrimarySitePointer;

    fn record_id(&self) -> String {
        Self::ID.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_state_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&SiteState::StandbySyncing).unwrap(),
            "\"STANDBY_SYNCING\""
        );
        assert_eq!(format!("{}", SiteState::ActiveSwitchingOver), "ACTIVE_SWITCHING_OVER");
    }

    #[test]
    fn test_site_state_classification() {
        assert!(SiteState::Active.is_active());
        assert!(SiteState::StandbySynced.is_standby());
        assert!(SiteState::StandbyAdding.is_transitional());
        assert!(!SiteState::StandbyPaused.is_transitional());
        assert!(SiteState::StandbyError.is_error());
    }

    #[test]
    fn test_scope_table() {
        assert_eq!(ConfigKind::Site.scope(), ConfigScope::Global);
        assert_eq!(ConfigKind::TargetInfo.scope(), ConfigScope::Global);
        assert_eq!(ConfigKind::SiteInfo.scope(), ConfigScope::Site);
        assert_eq!(ConfigKind::RepositoryInfo.scope(), ConfigScope::Site);
    }

    #[test]
    fn test_site_transition_clears_error() {
        let mut site = Site::new("site-2", "10.0.0.2", 3);
        site.fail(SiteError::new("add-standby", "firewall reconfig failed"));
        assert!(site.state.is_error());
        assert!(site.error.is_some());

        site.transition(SiteState::StandbySyncing);
        assert_eq!(site.state, SiteState::StandbySyncing);
        assert!(site.error.is_none());
    }

    #[test]
    fn test_target_info_request_bumps_version() {
        let mut target = TargetInfo::initial("3.6.2");
        assert_eq!(target.config_version, 1);
        target.request("add-standby", Some("site-2".into()));
        assert_eq!(target.config_version, 2);
        assert_eq!(target.action.as_deref(), Some("add-standby"));
    }
}
