//! DR operation handlers
//!
//! Each handler implements one target action ("add-standby", "switchover",
//! ...). Dispatch is a registry lookup by action name; handlers never form a
//! hierarchy. Every handler re-derives its work from durable target state,
//! so re-running one after a crash is safe, and every failure is converted
//! at the dispatch boundary into a STANDBY_ERROR with a structured cause
//! rather than thrown out of the control loop.

use crate::config::records::{DrOperationStatus, PrimarySitePointer, Site, SiteError, SiteState, TargetInfo};
use crate::config::store::ConfigStore;
use crate::coordination::barrier::{DistributedBarrier, DistributedDoubleBarrier};
use crate::coordination::election::LeaderElector;
use crate::coordination::lock::DistributedLock;
use crate::coordination::session::CoordinationClient;
use crate::domain::ports::{ClusterMembershipRef, LocalRepositoryRef, SiteControlClientRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod add_standby;
mod data_revision;
mod failover;
mod pause_resume;
mod remove_standby;
mod rotate_keys;
mod switchover;

pub use add_standby::AddStandbyHandler;
pub use data_revision::ChangeDataRevisionHandler;
pub use failover::{FailoverHandler, REBOOT_LOCK};
pub use pause_resume::{PauseStandbyHandler, ResumeStandbyHandler};
pub use remove_standby::RemoveStandbyHandler;
pub use rotate_keys::RotateKeysHandler;
pub use switchover::SwitchoverHandler;

// =============================================================================
// Timeouts
// =============================================================================

/// Deadlines applied to every blocking coordination step
#[derive(Debug, Clone)]
pub struct DrTimeouts {
    /// Lock acquisition
    pub lock: Duration,
    /// Barrier enter/leave
    pub barrier: Duration,
    /// Waiting for a remote site's state or leader marker to flip
    pub state_flip: Duration,
}

impl Default for DrTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(60),
            barrier: Duration::from_secs(120),
            state_flip: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Handler Context
// =============================================================================

/// Everything a handler needs for one execution
pub struct HandlerContext {
    pub client: Arc<CoordinationClient>,
    pub config: Arc<ConfigStore>,
    pub repository: LocalRepositoryRef,
    pub site_control: SiteControlClientRef,
    pub membership: ClusterMembershipRef,
    /// The target configuration this execution is reconciling toward
    pub target: TargetInfo,
    /// This process's participation in its site's leader election
    pub site_elector: Arc<LeaderElector>,
    pub timeouts: DrTimeouts,
}

impl HandlerContext {
    pub fn local_site_id(&self) -> &str {
        self.client.site_id()
    }

    pub fn node_id(&self) -> &str {
        self.client.node_id()
    }

    /// Site the target action applies to
    pub fn target_site_id(&self) -> Result<&str> {
        self.target
            .target_site
            .as_deref()
            .ok_or_else(|| Error::Configuration("target action carries no target site".into()))
    }

    pub fn is_local(&self, site_id: &str) -> bool {
        site_id == self.local_site_id()
    }

    pub async fn site(&self, site_id: &str) -> Result<Site> {
        self.config
            .query::<Site>(site_id)
            .await?
            .ok_or_else(|| Error::SiteNotFound {
                site_id: site_id.to_string(),
            })
    }

    pub async fn try_site(&self, site_id: &str) -> Result<Option<Site>> {
        self.config.query::<Site>(site_id).await
    }

    /// Transition a site only if it currently holds one of `from`.
    /// Returns whether a transition happened, making re-runs no-ops.
    pub async fn transition_site(
        &self,
        site_id: &str,
        from: &[SiteState],
        to: SiteState,
    ) -> Result<bool> {
        let mut site = self.site(site_id).await?;
        if site.state == to {
            return Ok(false);
        }
        if !from.contains(&site.state) {
            return Ok(false);
        }
        info!(site = %site_id, from = %site.state, to = %to, "site state transition");
        site.transition(to);
        self.config.persist(&site).await?;
        Ok(true)
    }

    /// Force a site into STANDBY_ERROR with a structured cause
    pub async fn fail_site(&self, site_id: &str, operation: &str, message: &str) -> Result<()> {
        if let Some(mut site) = self.try_site(site_id).await? {
            if !site.state.is_error() {
                error!(site = %site_id, operation, message, "site forced to STANDBY_ERROR");
                site.fail(SiteError::new(operation, message));
                self.config.persist(&site).await?;
            }
        }
        Ok(())
    }

    /// Record an in-flight DR operation for the audit reconciler, once
    pub async fn track_operation(
        &self,
        site_id: &str,
        operation: &str,
        interim_state: SiteState,
    ) -> Result<()> {
        if self
            .config
            .query::<DrOperationStatus>(site_id)
            .await?
            .is_none()
        {
            self.config
                .persist(&DrOperationStatus {
                    site_id: site_id.to_string(),
                    operation: operation.to_string(),
                    interim_state,
                    started_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn primary_site(&self) -> Result<Option<PrimarySitePointer>> {
        self.config
            .query::<PrimarySitePointer>(PrimarySitePointer::ID)
            .await
    }

    /// Whether this node's site is the active site
    pub async fn local_site_is_active(&self) -> Result<bool> {
        Ok(self
            .primary_site()
            .await?
            .map(|p| p.site_id == self.local_site_id())
            .unwrap_or(false))
    }

    pub fn lock(&self, name: &str) -> DistributedLock {
        DistributedLock::new(self.client.store().clone(), name, self.node_id())
    }

    pub fn barrier(&self, name: &str, required: u32) -> DistributedBarrier {
        DistributedBarrier::new(self.client.store().clone(), name, required)
    }

    pub fn double_barrier(&self, name: &str, required: u32) -> DistributedDoubleBarrier {
        DistributedDoubleBarrier::new(
            self.client.store().clone(),
            name,
            self.node_id(),
            required,
        )
    }

    /// Structured handler-step failure
    pub fn step_error(&self, site_id: &str, operation: &str, reason: impl Into<String>) -> Error {
        Error::SiteOperationFailed {
            site_id: site_id.to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Shared Waits
// =============================================================================

pub(crate) const STATE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Poll until a site reaches one of `wanted`. A site that lands in
/// STANDBY_ERROR aborts the wait immediately.
pub(crate) async fn wait_for_site_state(
    ctx: &HandlerContext,
    site_id: &str,
    wanted: &[SiteState],
    timeout: Duration,
) -> Result<()> {
    let started = std::time::Instant::now();
    loop {
        let site = ctx.site(site_id).await?;
        if wanted.contains(&site.state) {
            return Ok(());
        }
        if site.state.is_error() {
            return Err(ctx.step_error(
                site_id,
                "wait-for-state",
                format!("site entered {}", site.state),
            ));
        }
        if started.elapsed() >= timeout {
            return Err(Error::Timeout {
                operation: format!("wait for site {site_id} to reach {wanted:?}"),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }
}

/// Poll until no candidate leads the named site election. Used to rule out
/// two simultaneously active sites during a switchover.
pub(crate) async fn wait_for_leader_vacancy(
    ctx: &HandlerContext,
    site_id: &str,
    timeout: Duration,
) -> Result<()> {
    let elector = LeaderElector::new(
        ctx.client.store().clone(),
        site_leader_election(site_id),
        ctx.node_id(),
    );
    let started = std::time::Instant::now();
    loop {
        if elector.leader_id().await?.is_none() {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(Error::Timeout {
                operation: format!("wait for site {site_id} leader to step down"),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }
}

/// Election name carrying a site's "I am serving as active" marker
pub fn site_leader_election(site_id: &str) -> String {
    format!("site-leader-{site_id}")
}

// =============================================================================
// Handler Trait and Registry
// =============================================================================

/// One DR transition, selected by the target's action name
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Action name this handler serves
    fn action(&self) -> &'static str;

    /// Run the transition. Must be idempotent across re-execution.
    async fn execute(&self, ctx: &HandlerContext) -> Result<()>;
}

/// Action-name to handler map
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with every built-in DR handler
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AddStandbyHandler));
        registry.register(Arc::new(RemoveStandbyHandler));
        registry.register(Arc::new(PauseStandbyHandler));
        registry.register(Arc::new(ResumeStandbyHandler));
        registry.register(Arc::new(SwitchoverHandler));
        registry.register(Arc::new(FailoverHandler));
        registry.register(Arc::new(ChangeDataRevisionHandler));
        registry.register(Arc::new(RotateKeysHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.action(), handler);
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Execute the handler named by `action`, converting any failure into a
    /// persisted site error instead of propagating it out of the loop
    pub async fn dispatch(&self, ctx: &HandlerContext, action: &str) -> Result<()> {
        let handler = self.get(action).ok_or_else(|| Error::UnknownAction {
            action: action.to_string(),
        })?;
        match handler.execute(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(action, error = %e, "DR handler failed");
                if let Some(site_id) = ctx.target.target_site.clone() {
                    ctx.fail_site(&site_id, action, &e.to_string()).await?;
                }
                Err(e)
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_all_actions() {
        let registry = HandlerRegistry::standard();
        assert_eq!(
            registry.actions(),
            vec![
                "add-standby",
                "change-data-revision",
                "failover",
                "pause-standby",
                "remove-standby",
                "resume-standby",
                "rotate-keys",
                "switchover",
            ]
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let registry = HandlerRegistry::standard();
        assert!(registry.get("defragment-moon").is_none());
    }
}
