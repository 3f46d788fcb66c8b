//! End-to-end DR scenarios over the in-memory coordination store.
//!
//! Each test stands up one manager per node against a shared tree and
//! drives the control loop by hand, so multi-node waits (barriers, leader
//! hand-off) really do cross task boundaries.

use assert_matches::assert_matches;
use multisite_coordinator::coordination::memory::MemoryCoordination;
use multisite_coordinator::coordination::session::CoordinationClient;
use multisite_coordinator::domain::ports::{
    LoopbackSiteControl, MemoryAuditLog, StandaloneMembership, StandaloneRepository,
};
use multisite_coordinator::sitemgr::{DrTimeouts, HandlerContext, HandlerRegistry};
use multisite_coordinator::{
    AuditStatus, ClusterMembership, ConfigStore, DistributedLock, DrOperationStatus, Error,
    PrimarySitePointer, Site, SiteState, TargetInfo, VdcManager, VdcManagerConfig,
};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test Cluster
// =============================================================================

struct Node {
    client: Arc<CoordinationClient>,
    config: Arc<ConfigStore>,
    repository: Arc<StandaloneRepository>,
    audit: Arc<MemoryAuditLog>,
    manager: Arc<VdcManager>,
}

struct TestCluster {
    cluster: MemoryCoordination,
    site_control: Arc<LoopbackSiteControl>,
    membership: Arc<StandaloneMembership>,
}

impl TestCluster {
    fn new(nodes: &[&str]) -> Self {
        Self {
            cluster: MemoryCoordination::new(),
            site_control: LoopbackSiteControl::new(),
            membership: StandaloneMembership::with_nodes(nodes),
        }
    }

    fn node(&self, site_id: &str, node_id: &str) -> Node {
        let session = self.cluster.connect();
        let client = CoordinationClient::new(session.clone(), site_id, node_id);
        let config = Arc::new(ConfigStore::new(session, site_id));
        let repository = StandaloneRepository::new();
        let audit = MemoryAuditLog::new();
        let manager = VdcManager::new(
            client.clone(),
            config.clone(),
            repository.clone(),
            audit.clone(),
            self.site_control.clone(),
            self.membership.clone(),
            VdcManagerConfig {
                software_version: "3.6.2".into(),
                poll_interval: Duration::from_millis(10),
                dr_operation_timeout: Duration::from_secs(60),
                timeouts: DrTimeouts {
                    lock: Duration::from_millis(400),
                    barrier: Duration::from_secs(2),
                    state_flip: Duration::from_secs(2),
                },
            },
        );
        Node {
            client,
            config,
            repository,
            audit,
            manager,
        }
    }

    async fn seed(&self, active: (&str, u32), standbys: &[(&str, u32, SiteState)]) {
        let session = self.cluster.connect();
        let config = ConfigStore::new(session, active.0);
        let mut site = Site::new(active.0, "10.0.0.1", active.1);
        site.transition(SiteState::Active);
        config.persist(&site).await.unwrap();
        config
            .persist(&PrimarySitePointer::pointing_at(active.0))
            .await
            .unwrap();
        for (site_id, node_count, state) in standbys {
            let mut standby = Site::new(*site_id, "10.0.0.2", *node_count);
            standby.transition(*state);
            config.persist(&standby).await.unwrap();
        }
        config.persist(&TargetInfo::initial("3.6.2")).await.unwrap();
    }

    async fn request(&self, action: &str, target_site: Option<&str>) -> TargetInfo {
        let config = ConfigStore::new(self.cluster.connect(), "seed");
        let mut target: TargetInfo = config.query(TargetInfo::ID).await.unwrap().unwrap();
        target.request(action, target_site.map(str::to_string));
        config.persist(&target).await.unwrap();
        target
    }
}

// =============================================================================
// Standby Lifecycle
// =============================================================================

#[tokio::test]
async fn test_add_standby_reaches_synced_and_is_audited() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[]).await;
    let active = tc.node("site-1", "node-1");
    let standby = tc.node("site-2", "node-1");

    // Operator registers the new site and requests the attach
    active
        .config
        .persist(&Site::new("site-2", "10.0.0.2", 1))
        .await
        .unwrap();
    tc.request("add-standby", Some("site-2")).await;

    active.manager.run_iteration().await.unwrap();
    standby.manager.run_iteration().await.unwrap();

    let site: Site = active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::StandbySynced);
    assert_eq!(standby.repository.property("data_revision").as_deref(), Some("0"));
    // Active side disabled maintenance against the syncing site
    assert_eq!(
        active
            .repository
            .property("maintenance.disabled.site-2")
            .as_deref(),
        Some("true")
    );

    // Completion is audited exactly once across the cluster
    active.manager.run_iteration().await.unwrap();
    standby.manager.run_iteration().await.unwrap();
    let entries: Vec<_> = active
        .audit
        .entries()
        .into_iter()
        .chain(standby.audit.entries())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_type, "add-standby");
    assert_eq!(entries[0].status, AuditStatus::Success);
}

#[tokio::test]
async fn test_remove_standby_powers_off_and_drops_records() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbySynced)])
        .await;
    let active = tc.node("site-1", "node-1");
    tc.membership
        .update_strategy_options(vec!["site-1".into(), "site-2".into()])
        .await
        .unwrap();

    tc.request("remove-standby", Some("site-2")).await;
    active.manager.run_iteration().await.unwrap();

    assert_eq!(tc.site_control.powered_off(), vec!["site-2".to_string()]);
    assert!(active
        .config
        .query::<Site>("site-2")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        tc.membership.strategy_options().await.unwrap(),
        vec!["site-1".to_string()]
    );
    assert_eq!(
        tc.membership.live_nodes().await.unwrap(),
        vec!["site-1/node-1".to_string()]
    );

    // The vanished record audits as a successful removal
    active.manager.run_iteration().await.unwrap();
    let entries = active.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_type, "remove-standby");
    assert_eq!(entries[0].status, AuditStatus::Success);
}

#[tokio::test]
async fn test_remove_standby_blocked_by_held_lock_errors_the_site() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbySynced)])
        .await;
    let active = tc.node("site-1", "node-1");

    // Another process is mid-removal and holds the lock
    let foreign = DistributedLock::new(tc.cluster.connect(), "drRemoveStandbyLock", "other-node");
    foreign.acquire(Duration::from_secs(1)).await.unwrap();

    tc.request("remove-standby", Some("site-2")).await;
    let err = active.manager.run_iteration().await.unwrap_err();
    assert!(err.is_timeout());

    // The dispatch boundary surfaced the failure on the site
    let site: Site = active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::StandbyError);
    let cause = site.error.unwrap();
    assert_eq!(cause.operation, "remove-standby");

    // Once the lock frees up the retry recovers the errored site
    foreign.release().await.unwrap();
    active.manager.run_iteration().await.unwrap();
    assert!(active
        .config
        .query::<Site>("site-2")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_pause_and_resume_standby() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbySynced)])
        .await;
    let active = tc.node("site-1", "node-1");
    let standby = tc.node("site-2", "node-1");
    tc.membership
        .update_strategy_options(vec!["site-1".into(), "site-2".into()])
        .await
        .unwrap();

    tc.request("pause-standby", Some("site-2")).await;
    let active_run = {
        let manager = active.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    standby.manager.run_iteration().await.unwrap();
    active_run.await.unwrap().unwrap();

    let site: Site = active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::StandbyPaused);
    assert_eq!(tc.site_control.blocked(), vec!["site-2".to_string()]);
    assert_eq!(
        tc.membership.strategy_options().await.unwrap(),
        vec!["site-1".to_string()]
    );

    tc.request("resume-standby", Some("site-2")).await;
    let active_run = {
        let manager = active.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    standby.manager.run_iteration().await.unwrap();
    active_run.await.unwrap().unwrap();

    let site: Site = active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::StandbySynced);
    assert!(tc.site_control.blocked().is_empty());
    assert!(tc
        .membership
        .strategy_options()
        .await
        .unwrap()
        .contains(&"site-2".to_string()));
}

// =============================================================================
// Switchover / Failover
// =============================================================================

#[tokio::test]
async fn test_switchover_hands_active_role_across_sites() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbySynced)])
        .await;
    let old_active = tc.node("site-1", "node-1");
    let new_active = tc.node("site-2", "node-1");

    // First tick announces the active site's leader marker
    old_active.manager.run_iteration().await.unwrap();

    tc.request("switchover", Some("site-2")).await;
    let t1 = {
        let manager = old_active.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    let t2 = {
        let manager = new_active.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    let pointer: PrimarySitePointer = old_active
        .config
        .query(PrimarySitePointer::ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pointer.site_id, "site-2");

    let site1: Site = old_active.config.query("site-1").await.unwrap().unwrap();
    let site2: Site = old_active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site1.state, SiteState::StandbySynced);
    assert_eq!(site2.state, SiteState::Active);

    // Old side fenced its write path; new side brought its own up
    assert!(old_active
        .repository
        .actions()
        .contains(&"stop:apisvc".to_string()));
    assert!(new_active
        .repository
        .actions()
        .contains(&"restart:apisvc".to_string()));
}

#[tokio::test]
async fn test_failover_promotes_standby_and_purges_lost_active() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbySynced)])
        .await;
    // site-1 is gone; only the surviving standby's manager runs
    let survivor = tc.node("site-2", "node-1");

    tc.request("failover", Some("site-2")).await;
    survivor.manager.run_iteration().await.unwrap();

    let pointer: PrimarySitePointer = survivor
        .config
        .query(PrimarySitePointer::ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pointer.site_id, "site-2");
    assert!(survivor
        .config
        .query::<Site>("site-1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        tc.membership.live_nodes().await.unwrap(),
        vec!["site-2/node-1".to_string()]
    );

    let site: Site = survivor.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::Active);
    // The promoted node rebooted onto the new topology
    assert!(survivor
        .repository
        .actions()
        .contains(&"reboot".to_string()));
}

// =============================================================================
// Data Revision
// =============================================================================

#[tokio::test]
async fn test_data_revision_commits_on_all_nodes_together() {
    let tc = TestCluster::new(&["site-1/node-1", "site-1/node-2"]);
    tc.seed(("site-1", 2), &[]).await;
    let n1 = tc.node("site-1", "node-1");
    let n2 = tc.node("site-1", "node-2");

    let config = ConfigStore::new(tc.cluster.connect(), "site-1");
    let mut target: TargetInfo = config.query(TargetInfo::ID).await.unwrap().unwrap();
    target.data_revision = 5;
    target.request("change-data-revision", None);
    config.persist(&target).await.unwrap();

    let t1 = {
        let manager = n1.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    let t2 = {
        let manager = n2.manager.clone();
        tokio::spawn(async move { manager.run_iteration().await })
    };
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    for node in [&n1, &n2] {
        assert_eq!(node.repository.property("data_revision").as_deref(), Some("5"));
        assert_eq!(
            node.repository.property("data_revision_pending").as_deref(),
            Some("")
        );
        assert!(node
            .repository
            .actions()
            .contains(&"restart:dbsvc".to_string()));
    }
}

#[tokio::test]
async fn test_data_revision_aborts_cleanly_without_full_quorum() {
    let tc = TestCluster::new(&["site-1/node-1", "site-1/node-2"]);
    tc.seed(("site-1", 2), &[]).await;
    let n1 = tc.node("site-1", "node-1");

    let config = ConfigStore::new(tc.cluster.connect(), "site-1");
    let mut target: TargetInfo = config.query(TargetInfo::ID).await.unwrap().unwrap();
    target.data_revision = 5;
    target.request("change-data-revision", None);
    config.persist(&target).await.unwrap();

    // Second node never shows up: the round aborts before anything commits
    let err = n1.manager.run_iteration().await.unwrap_err();
    assert_matches!(err, Error::BarrierIncomplete { required: 2, .. });
    assert!(n1.repository.property("data_revision").is_none());
    // Version not committed, so the next tick retries the round
    assert!(n1.repository.property("config_version").is_none());
}

// =============================================================================
// Idempotency and Timeouts
// =============================================================================

#[tokio::test]
async fn test_handler_rerun_is_idempotent() {
    let tc = TestCluster::new(&["site-1/node-1", "site-2/node-1"]);
    tc.seed(("site-1", 1), &[("site-2", 1, SiteState::StandbyAdding)])
        .await;
    let active = tc.node("site-1", "node-1");
    let target = tc.request("add-standby", Some("site-2")).await;

    let ctx = HandlerContext {
        client: active.client.clone(),
        config: active.config.clone(),
        repository: active.repository.clone(),
        site_control: tc.site_control.clone(),
        membership: tc.membership.clone(),
        target,
        site_elector: active.manager.site_elector().clone(),
        timeouts: DrTimeouts::default(),
    };
    let registry = HandlerRegistry::standard();

    // A crash-and-rerun dispatches the same action again
    registry.dispatch(&ctx, "add-standby").await.unwrap();
    registry.dispatch(&ctx, "add-standby").await.unwrap();

    let site: Site = active.config.query("site-2").await.unwrap().unwrap();
    assert_eq!(site.state, SiteState::StandbySyncing);
    // Only one tracking record exists for the reconciler
    let ops: Vec<DrOperationStatus> = active.config.query_all().await.unwrap();
    assert_eq!(ops.len(), 1);
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let tc = TestCluster::new(&["site-1/node-1"]);
    tc.seed(("site-1", 1), &[]).await;
    let active = tc.node("site-1", "node-1");
    tc.request("shrink-universe", None).await;

    let err = active.manager.run_iteration().await.unwrap_err();
    assert_matches!(err, Error::UnknownAction { .. });
}
