//! Site manager control loop
//!
//! One [`VdcManager`] runs per node. Each iteration it releases a reboot
//! lock left over from before a restart, honours a pending power-off
//! request, compares the node's local configuration version against the
//! cluster target and dispatches the target's action when the node lags,
//! scans remote sites for DR operations that have exceeded their deadline,
//! and finally audits completed operations under a cluster-wide lock so
//! exactly one record is written per operation.
//!
//! Errors inside an iteration are logged and retried on the next tick; the
//! loop itself never exits except through its cancellation token.

use crate::config::health::{derive_cluster_state, ClusterState};
use crate::config::records::{
    DrOperationStatus, PowerOffState, PrimarySitePointer, RepositoryInfo, Site, SiteError,
    TargetInfo,
};
use crate::config::store::ConfigStore;
use crate::coordination::election::LeaderElector;
use crate::coordination::lock::PersistentLock;
use crate::coordination::session::CoordinationClient;
use crate::domain::ports::{
    AuditLogRef, AuditStatus, ClusterMembershipRef, LocalRepositoryRef, SiteControlClientRef,
};
use crate::error::{Error, Result};
use crate::sitemgr::handlers::{
    site_leader_election, DrTimeouts, HandlerContext, HandlerRegistry, REBOOT_LOCK,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct VdcManagerConfig {
    /// Software version this node runs, published in its repository record
    pub software_version: String,
    /// Control loop tick interval
    pub poll_interval: Duration,
    /// Deadline after which an in-flight DR operation on a remote site is
    /// declared stalled and the site forced into STANDBY_ERROR
    pub dr_operation_timeout: Duration,
    pub timeouts: DrTimeouts,
}

impl Default for VdcManagerConfig {
    fn default() -> Self {
        Self {
            software_version: crate::VERSION.to_string(),
            poll_interval: Duration::from_secs(5),
            dr_operation_timeout: Duration::from_secs(30 * 60),
            timeouts: DrTimeouts::default(),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct VdcManager {
    client: Arc<CoordinationClient>,
    config: Arc<ConfigStore>,
    repository: LocalRepositoryRef,
    audit: AuditLogRef,
    site_control: SiteControlClientRef,
    membership: ClusterMembershipRef,
    registry: HandlerRegistry,
    site_elector: Arc<LeaderElector>,
    settings: VdcManagerConfig,
}

impl VdcManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<CoordinationClient>,
        config: Arc<ConfigStore>,
        repository: LocalRepositoryRef,
        audit: AuditLogRef,
        site_control: SiteControlClientRef,
        membership: ClusterMembershipRef,
        settings: VdcManagerConfig,
    ) -> Arc<Self> {
        let site_elector = Arc::new(LeaderElector::new(
            client.store().clone(),
            site_leader_election(client.site_id()),
            client.node_id(),
        ));
        Arc::new(Self {
            client,
            config,
            repository,
            audit,
            site_control,
            membership,
            registry: HandlerRegistry::standard(),
            site_elector,
            settings,
        })
    }

    pub fn site_elector(&self) -> &Arc<LeaderElector> {
        &self.site_elector
    }

    /// Run the control loop until cancelled
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(site = %manager.client.site_id(), node = %manager.client.node_id(), "site manager started");
            loop {
                if let Err(e) = manager.run_iteration().await {
                    warn!(error = %e, action = ?e.action(), "manager iteration failed, will retry");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("site manager stopping");
                        return;
                    }
                    _ = tokio::time::sleep(manager.settings.poll_interval) => {}
                }
            }
        })
    }

    /// One pass of the control loop, in its fixed order
    pub async fn run_iteration(&self) -> Result<()> {
        self.release_stale_reboot_lock().await?;

        let Some(target) = self.config.query::<TargetInfo>(TargetInfo::ID).await? else {
            // Cluster not initialised yet
            return Ok(());
        };

        if target.power_off != PowerOffState::None {
            return self.execute_power_off(&target).await;
        }

        if self.local_site_is_active().await? {
            // Candidacy is idempotent; the marker is what a switchover's
            // incoming site waits on
            self.site_elector.announce().await?;
        }

        let local_version = self.local_config_version().await?;
        if local_version < target.config_version {
            if let Some(action) = target.action.clone() {
                let ctx = self.handler_context(target.clone());
                self.registry.dispatch(&ctx, &action).await?;
            }
            self.commit_local_version(&target).await?;
        }

        self.scan_stalled_operations().await?;
        self.audit_completed_operations().await?;
        self.publish_repository_info(&target).await?;
        Ok(())
    }

    /// Cluster health derived from desired vs observed state. Never stored.
    pub async fn cluster_state(&self) -> Result<ClusterState> {
        let Some(target) = self.config.query::<TargetInfo>(TargetInfo::ID).await? else {
            return Ok(ClusterState::Unknown);
        };
        let observed: Vec<RepositoryInfo> = self.config.query_all().await?;
        let expected = self
            .config
            .query::<Site>(self.client.site_id())
            .await?
            .map(|s| s.node_count)
            .unwrap_or(0);
        Ok(derive_cluster_state(&target, &observed, expected))
    }

    // =========================================================================
    // Iteration Steps
    // =========================================================================

    /// A reboot we requested holds the durable reboot lock across the
    /// restart; coming back up is what releases it
    async fn release_stale_reboot_lock(&self) -> Result<()> {
        let lock = PersistentLock::new(
            self.client.store().clone(),
            REBOOT_LOCK,
            self.client.node_id(),
        );
        if let Some(record) = lock.owner().await? {
            if record.owner == self.client.node_id() {
                info!(acquired_at = %record.acquired_at, "releasing reboot lock held across restart");
                lock.release().await?;
            }
        }
        Ok(())
    }

    /// Graceful power-off drains the whole site behind a double barrier; if
    /// the group never forms, progress wins and the node powers off anyway
    async fn execute_power_off(&self, target: &TargetInfo) -> Result<()> {
        if target.power_off == PowerOffState::Forced {
            warn!("forced power-off requested");
            return self.repository.power_off().await;
        }

        let node_count = self
            .config
            .query::<Site>(self.client.site_id())
            .await?
            .map(|s| s.node_count)
            .unwrap_or(1);
        let barrier = HandlerContext {
            client: self.client.clone(),
            config: self.config.clone(),
            repository: self.repository.clone(),
            site_control: self.site_control.clone(),
            membership: self.membership.clone(),
            target: target.clone(),
            site_elector: self.site_elector.clone(),
            timeouts: self.settings.timeouts.clone(),
        }
        .double_barrier(
            &format!("poweroff-{}", target.config_version),
            node_count,
        );

        match barrier.enter(self.settings.timeouts.barrier).await {
            Ok(()) => {
                self.repository.stop_service("apisvc").await?;
                self.repository.stop_service("dbsvc").await?;
                barrier.leave(self.settings.timeouts.barrier).await?;
                info!("graceful power-off, site drained");
            }
            Err(e) => {
                // Favor progress over a clean drain
                warn!(error = %e, "graceful power-off barrier incomplete, powering off anyway");
            }
        }
        self.repository.power_off().await
    }

    /// Flag remote sites whose in-flight DR operation blew its deadline.
    /// `fail` is a no-op on a site already in STANDBY_ERROR, so the flip
    /// happens exactly once cluster-wide.
    async fn scan_stalled_operations(&self) -> Result<()> {
        let operations: Vec<DrOperationStatus> = self.config.query_all().await?;
        let now = Utc::now();
        for op in operations {
            let deadline = op.started_at
                + chrono::Duration::from_std(self.settings.dr_operation_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
            if now < deadline {
                continue;
            }
            let Some(mut site) = self.config.query::<Site>(&op.site_id).await? else {
                continue;
            };
            if site.state.is_transitional() {
                error!(site = %op.site_id, operation = %op.operation, started_at = %op.started_at, "DR operation exceeded its deadline");
                site.fail(SiteError::new(
                    &op.operation,
                    format!("operation exceeded deadline, started at {}", op.started_at),
                ));
                self.config.persist(&site).await?;
            }
        }
        Ok(())
    }

    /// Write exactly one audit record per finished DR operation, then drop
    /// its tracking record. Serialized by a cluster-wide lock; losing the
    /// lock race just means another node audits this tick.
    async fn audit_completed_operations(&self) -> Result<()> {
        let pending: Vec<DrOperationStatus> = self.config.query_all().await?;
        if pending.is_empty() {
            return Ok(());
        }

        let lock = self.handler_lock("drOpAuditLock");
        if lock.acquire(Duration::from_millis(250)).await.is_err() {
            return Ok(());
        }
        let result = self.audit_under_lock().await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "audit lock release failed");
        }
        result
    }

    async fn audit_under_lock(&self) -> Result<()> {
        // A node queued ahead of us may have audited and dropped records
        // while we waited for the lock; only the view taken under the lock
        // decides what still needs an audit entry
        let operations: Vec<DrOperationStatus> = self.config.query_all().await?;
        for op in operations {
            let outcome = match self.config.query::<Site>(&op.site_id).await? {
                None => {
                    // Removal deletes the record; for anything else a
                    // missing site is a failure
                    if op.operation == "remove-standby" {
                        Some((AuditStatus::Success, format!("site {} removed", op.site_id)))
                    } else {
                        Some((
                            AuditStatus::Failure,
                            format!("site {} record disappeared", op.site_id),
                        ))
                    }
                }
                Some(site) if site.state == op.interim_state => None, // still in flight
                Some(site) if site.state.is_error() => {
                    let cause = site
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown".to_string());
                    Some((AuditStatus::Failure, cause))
                }
                Some(site) => Some((
                    AuditStatus::Success,
                    format!("site {} now {}", op.site_id, site.state),
                )),
            };

            if let Some((status, message)) = outcome {
                self.audit
                    .record(&op.operation, status, &op.site_id, &message)
                    .await?;
                self.config.remove::<DrOperationStatus>(&op.site_id).await?;
                info!(operation = %op.operation, site = %op.site_id, %status, "DR operation audited");
            }
        }
        Ok(())
    }

    /// Publish this node's observed configuration
    async fn publish_repository_info(&self, _target: &TargetInfo) -> Result<()> {
        let info = RepositoryInfo {
            node_id: self.client.node_id().to_string(),
            site_id: self.client.site_id().to_string(),
            software_version: self.settings.software_version.clone(),
            config_version: self.local_config_version().await?,
            data_revision: self.local_data_revision().await?,
            published_at: Utc::now(),
        };
        self.config.persist(&info).await
    }

    // =========================================================================
    // Local State
    // =========================================================================

    async fn local_config_version(&self) -> Result<u64> {
        self.numeric_property("config_version").await
    }

    async fn local_data_revision(&self) -> Result<u64> {
        self.numeric_property("data_revision").await
    }

    async fn numeric_property(&self, key: &str) -> Result<u64> {
        match self.repository.get_property(key).await? {
            Some(value) if !value.is_empty() => value.parse().map_err(|_| {
                Error::Configuration(format!("property {key} holds non-numeric value {value}"))
            }),
            _ => Ok(0),
        }
    }

    async fn commit_local_version(&self, target: &TargetInfo) -> Result<()> {
        self.repository
            .set_property("config_version", &target.config_version.to_string())
            .await?;
        info!(version = target.config_version, action = ?target.action, "local configuration version committed");
        Ok(())
    }

    async fn local_site_is_active(&self) -> Result<bool> {
        Ok(self
            .config
            .query::<PrimarySitePointer>(PrimarySitePointer::ID)
            .await?
            .map(|p| p.site_id == self.client.site_id())
            .unwrap_or(false))
    }

    fn handler_lock(&self, name: &str) -> crate::coordination::lock::DistributedLock {
        crate::coordination::lock::DistributedLock::new(
            self.client.store().clone(),
            name,
            self.client.node_id(),
        )
    }

    fn handler_context(&self, target: TargetInfo) -> HandlerContext {
        HandlerContext {
            client: self.client.clone(),
            config: self.config.clone(),
            repository: self.repository.clone(),
            site_control: self.site_control.clone(),
            membership: self.membership.clone(),
            target,
            site_elector: self.site_elector.clone(),
            timeouts: self.settings.timeouts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::records::SiteState;
    use crate::coordination::memory::MemoryCoordination;
    use crate::domain::ports::{
        LoopbackSiteControl, MemoryAuditLog, StandaloneMembership, StandaloneRepository,
    };

    struct Harness {
        cluster: MemoryCoordination,
        config: Arc<ConfigStore>,
        repository: Arc<StandaloneRepository>,
        audit: Arc<MemoryAuditLog>,
        manager: Arc<VdcManager>,
    }

    fn harness(site_id: &str, node_id: &str) -> Harness {
        let cluster = MemoryCoordination::new();
        harness_on(&cluster, site_id, node_id)
    }

    fn harness_on(cluster: &MemoryCoordination, site_id: &str, node_id: &str) -> Harness {
        let session = cluster.connect();
        let client = CoordinationClient::new(session.clone(), site_id, node_id);
        let config = Arc::new(ConfigStore::new(session, site_id));
        let repository = StandaloneRepository::new();
        let audit = MemoryAuditLog::new();
        let settings = VdcManagerConfig {
            software_version: "3.6.2".into(),
            poll_interval: Duration::from_millis(10),
            dr_operation_timeout: Duration::from_millis(200),
            timeouts: DrTimeouts {
                lock: Duration::from_secs(2),
                barrier: Duration::from_millis(300),
                state_flip: Duration::from_secs(2),
            },
        };
        let manager = VdcManager::new(
            client,
            config.clone(),
            repository.clone(),
            audit.clone(),
            LoopbackSiteControl::new(),
            StandaloneMembership::with_nodes(&["site-1/node-1"]),
            settings,
        );
        Harness {
            cluster: cluster.clone(),
            config,
            repository,
            audit,
            manager,
        }
    }

    async fn seed_active_site(h: &Harness, site_id: &str) {
        let mut site = Site::new(site_id, "10.0.0.1", 1);
        site.transition(SiteState::Active);
        h.config.persist(&site).await.unwrap();
        h.config
            .persist(&PrimarySitePointer::pointing_at(site_id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_iteration_without_target_is_a_noop() {
        let h = harness("site-1", "node-1");
        h.manager.run_iteration().await.unwrap();
        assert!(h.repository.actions().is_empty());
    }

    #[tokio::test]
    async fn test_version_divergence_runs_action_once() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        h.config.persist(&Site::new("site-2", "10.0.0.2", 1)).await.unwrap();

        let mut target = TargetInfo::initial("3.6.2");
        target.request("add-standby", Some("site-2".into()));
        h.config.persist(&target).await.unwrap();

        h.manager.run_iteration().await.unwrap();
        assert_eq!(
            h.repository.property("config_version").as_deref(),
            Some("2")
        );
        let actions_after_first = h.repository.actions().len();
        assert!(actions_after_first > 0);

        // Version now matches: second iteration re-runs nothing
        h.manager.run_iteration().await.unwrap();
        assert_eq!(h.repository.actions().len(), actions_after_first);
    }

    #[tokio::test]
    async fn test_stalled_operation_flips_site_to_error_once() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        h.config.persist(&TargetInfo::initial("3.6.2")).await.unwrap();

        let mut standby = Site::new("site-2", "10.0.0.2", 1);
        standby.transition(SiteState::StandbySyncing);
        h.config.persist(&standby).await.unwrap();
        h.config
            .persist(&DrOperationStatus {
                site_id: "site-2".into(),
                operation: "add-standby".into(),
                interim_state: SiteState::StandbySyncing,
                started_at: Utc::now() - chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        h.manager.run_iteration().await.unwrap();
        let site: Site = h.config.query("site-2").await.unwrap().unwrap();
        assert_eq!(site.state, SiteState::StandbyError);
        let error = site.error.unwrap();
        assert_eq!(error.operation, "add-standby");

        // The error is then audited as a failure and the tracker dropped
        h.manager.run_iteration().await.unwrap();
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Failure);
        assert!(h
            .config
            .query::<DrOperationStatus>("site-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_completed_operation_audited_exactly_once() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        h.config.persist(&TargetInfo::initial("3.6.2")).await.unwrap();

        let mut standby = Site::new("site-2", "10.0.0.2", 1);
        standby.transition(SiteState::StandbySynced);
        h.config.persist(&standby).await.unwrap();
        h.config
            .persist(&DrOperationStatus {
                site_id: "site-2".into(),
                operation: "add-standby".into(),
                interim_state: SiteState::StandbySyncing,
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        h.manager.run_iteration().await.unwrap();
        h.manager.run_iteration().await.unwrap();

        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Success);
        assert_eq!(entries[0].event_type, "add-standby");
    }

    #[tokio::test]
    async fn test_auditors_queued_behind_lock_write_one_record() {
        let cluster = MemoryCoordination::new();
        let a = harness_on(&cluster, "site-1", "node-1");
        let b = harness_on(&cluster, "site-1", "node-2");
        seed_active_site(&a, "site-1").await;

        let mut standby = Site::new("site-2", "10.0.0.2", 1);
        standby.transition(SiteState::StandbySynced);
        a.config.persist(&standby).await.unwrap();
        a.config
            .persist(&DrOperationStatus {
                site_id: "site-2".into(),
                operation: "add-standby".into(),
                interim_state: SiteState::StandbySyncing,
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        // A third party holds the audit lock, so both managers see the
        // finished operation before either can take the lock
        let foreign = crate::coordination::lock::DistributedLock::new(
            cluster.connect(),
            "drOpAuditLock",
            "other-node",
        );
        foreign.acquire(Duration::from_millis(200)).await.unwrap();

        let ta = {
            let manager = a.manager.clone();
            tokio::spawn(async move { manager.audit_completed_operations().await })
        };
        let tb = {
            let manager = b.manager.clone();
            tokio::spawn(async move { manager.audit_completed_operations().await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        foreign.release().await.unwrap();
        ta.await.unwrap().unwrap();
        tb.await.unwrap().unwrap();

        // The second holder re-reads under the lock and finds nothing left
        let entries: Vec<_> = a
            .audit
            .entries()
            .into_iter()
            .chain(b.audit.entries())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(a
            .config
            .query::<DrOperationStatus>("site-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cluster_state_follows_published_repositories() {
        let h = harness("site-1", "node-1");
        assert_eq!(h.manager.cluster_state().await.unwrap(), ClusterState::Unknown);

        seed_active_site(&h, "site-1").await;
        h.config.persist(&TargetInfo::initial("3.6.2")).await.unwrap();

        // Before this node publishes, nothing has reported in
        assert_eq!(h.manager.cluster_state().await.unwrap(), ClusterState::Unknown);

        h.manager.run_iteration().await.unwrap();
        assert_eq!(h.manager.cluster_state().await.unwrap(), ClusterState::Stable);
    }

    #[tokio::test]
    async fn test_forced_power_off() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        let mut target = TargetInfo::initial("3.6.2");
        target.power_off = PowerOffState::Forced;
        h.config.persist(&target).await.unwrap();

        h.manager.run_iteration().await.unwrap();
        assert_eq!(h.repository.actions(), vec!["poweroff"]);
    }

    #[tokio::test]
    async fn test_graceful_power_off_single_node_drains_first() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        let mut target = TargetInfo::initial("3.6.2");
        target.power_off = PowerOffState::Graceful;
        h.config.persist(&target).await.unwrap();

        h.manager.run_iteration().await.unwrap();
        assert_eq!(
            h.repository.actions(),
            vec!["stop:apisvc", "stop:dbsvc", "poweroff"]
        );
    }

    #[tokio::test]
    async fn test_reboot_lock_released_on_restart() {
        let h = harness("site-1", "node-1");
        let lock = PersistentLock::new(h.cluster.connect(), REBOOT_LOCK, "node-1");
        lock.acquire().await.unwrap();

        h.manager.run_iteration().await.unwrap();
        assert!(lock.owner().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publishes_repository_info() {
        let h = harness("site-1", "node-1");
        seed_active_site(&h, "site-1").await;
        h.config.persist(&TargetInfo::initial("3.6.2")).await.unwrap();

        h.manager.run_iteration().await.unwrap();
        let info: RepositoryInfo = h.config.query("node-1").await.unwrap().unwrap();
        assert_eq!(info.software_version, "3.6.2");
        assert_eq!(info.site_id, "site-1");
    }
}
