//! switchover: planned exchange of the active and a synced standby.
//!
//! The outgoing active fences writes and steps out of its site-leader
//! election behind a role-tagged double barrier; the incoming active waits
//! for that leader marker to vanish before taking over behind its own
//! barrier. The wait is what rules out two simultaneously active sites.

use super::{
    site_leader_election, wait_for_leader_vacancy, HandlerContext, OperationHandler,
};
use crate::config::records::{PrimarySitePointer, SiteState};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::info;

pub struct SwitchoverHandler;

#[async_trait]
impl OperationHandler for SwitchoverHandler {
    fn action(&self) -> &'static str {
        "switchover"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let new_active = ctx.target_site_id()?.to_string();
        let pointer = ctx
            .primary_site()
            .await?
            .ok_or_else(|| Error::Configuration("no active site recorded".into()))?;
        let old_active = pointer.site_id;
        if old_active == new_active {
            // Pointer already flipped; nothing left to do on any node
            return Ok(());
        }
        let version = ctx.target.config_version;

        if ctx.is_local(&old_active) {
            self.step_down(ctx, &old_active, &new_active, version).await
        } else if ctx.is_local(&new_active) {
            self.take_over(ctx, &old_active, &new_active, version).await
        } else {
            // Uninvolved standby: refresh topology toward the new active
            ctx.repository.reconfigure_service("firewall").await?;
            ctx.repository.reconfigure_service("replicationsvc").await?;
            Ok(())
        }
    }
}

impl SwitchoverHandler {
    /// Outgoing active: fence writes in lockstep and release leadership
    async fn step_down(
        &self,
        ctx: &HandlerContext,
        old_active: &str,
        new_active: &str,
        version: u64,
    ) -> Result<()> {
        ctx.track_operation(new_active, "switchover", SiteState::StandbySwitchingOver)
            .await?;
        // Flip the successor into its interim state here too, so the audit
        // reconciler never observes the tracked operation against a site
        // still marked synced
        ctx.transition_site(
            new_active,
            &[SiteState::StandbySynced],
            SiteState::StandbySwitchingOver,
        )
        .await?;
        ctx.transition_site(
            old_active,
            &[SiteState::Active],
            SiteState::ActiveSwitchingOver,
        )
        .await?;

        let site = ctx.site(old_active).await?;
        let barrier = ctx.double_barrier(&format!("switchover-{version}-active"), site.node_count);
        barrier.enter(ctx.timeouts.barrier).await?;
        ctx.repository.stop_service("apisvc").await?;
        ctx.site_elector.relinquish().await?;
        barrier.leave(ctx.timeouts.barrier).await?;

        ctx.transition_site(
            old_active,
            &[SiteState::ActiveSwitchingOver],
            SiteState::StandbySynced,
        )
        .await?;
        info!(site = %old_active, successor = %new_active, "stepped down as active");
        Ok(())
    }

    /// Incoming active: wait for the old leader to vanish, then take over
    async fn take_over(
        &self,
        ctx: &HandlerContext,
        old_active: &str,
        new_active: &str,
        version: u64,
    ) -> Result<()> {
        ctx.track_operation(new_active, "switchover", SiteState::StandbySwitchingOver)
            .await?;
        ctx.transition_site(
            new_active,
            &[SiteState::StandbySynced],
            SiteState::StandbySwitchingOver,
        )
        .await?;

        wait_for_leader_vacancy(ctx, old_active, ctx.timeouts.state_flip).await?;

        let site = ctx.site(new_active).await?;
        let barrier = ctx.double_barrier(&format!("switchover-{version}-standby"), site.node_count);
        barrier.enter(ctx.timeouts.barrier).await?;
        ctx.repository.reconfigure_service("apisvc").await?;
        ctx.repository.restart_service("apisvc").await?;
        barrier.leave(ctx.timeouts.barrier).await?;

        ctx.config
            .persist(&PrimarySitePointer::pointing_at(new_active))
            .await?;
        ctx.transition_site(
            new_active,
            &[SiteState::StandbySwitchingOver],
            SiteState::Active,
        )
        .await?;
        ctx.site_elector.announce().await?;
        info!(site = %new_active, predecessor = %old_active, election = %site_leader_election(new_active), "took over as active");
        Ok(())
    }
}
