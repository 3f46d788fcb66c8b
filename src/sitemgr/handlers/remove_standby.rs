//! remove-standby: permanently detach a standby site.
//!
//! Driven from the active site under a named lock: power the standby off,
//! evict its storage nodes, drop it from the replication strategy, then
//! delete its records. The audit reconciler treats a vanished site record as
//! successful completion of this operation.

use super::{HandlerContext, OperationHandler};
use crate::config::records::{Site, SiteState};
use crate::error::Result;
use async_trait::async_trait;
use tracing::warn;

pub struct RemoveStandbyHandler;

#[async_trait]
impl OperationHandler for RemoveStandbyHandler {
    fn action(&self) -> &'static str {
        "remove-standby"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let standby = ctx.target_site_id()?.to_string();

        if ctx.is_local(&standby) {
            // The site being removed takes no part; its power-off arrives
            // through the site control endpoint
            return Ok(());
        }
        if !ctx.local_site_is_active().await? {
            // Uninvolved standbys just drop the site from their topology
            ctx.repository.reconfigure_service("firewall").await?;
            ctx.repository.reconfigure_service("ipsec").await?;
            return Ok(());
        }

        let lock = ctx.lock("drRemoveStandbyLock");
        lock.acquire(ctx.timeouts.lock).await?;
        let result = remove_steps(ctx, &standby).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "remove lock release failed");
        }
        result
    }
}

async fn remove_steps(ctx: &HandlerContext, standby: &str) -> Result<()> {
    // Already removed by a previous run or another node
    if ctx.try_site(standby).await?.is_none() {
        return Ok(());
    }

    ctx.track_operation(standby, "remove-standby", SiteState::StandbyRemoving)
        .await?;
    ctx.transition_site(
        standby,
        &[
            SiteState::StandbySynced,
            SiteState::StandbySyncing,
            SiteState::StandbyPaused,
            SiteState::StandbyError,
        ],
        SiteState::StandbyRemoving,
    )
    .await?;

    if let Err(e) = ctx.site_control.power_off(standby).await {
        return Err(ctx.step_error(standby, "remove-standby", format!("power-off failed: {e}")));
    }
    if let Err(e) = ctx.membership.evict_site(standby).await {
        return Err(ctx.step_error(standby, "remove-standby", format!("eviction failed: {e}")));
    }
    let mut sites = ctx.membership.strategy_options().await?;
    sites.retain(|s| s != standby);
    if let Err(e) = ctx.membership.update_strategy_options(sites).await {
        return Err(ctx.step_error(
            standby,
            "remove-standby",
            format!("strategy update failed: {e}"),
        ));
    }

    ctx.config.remove::<Site>(standby).await?;
    ctx.repository.reconfigure_service("firewall").await?;
    ctx.repository.reconfigure_service("ipsec").await?;
    Ok(())
}
