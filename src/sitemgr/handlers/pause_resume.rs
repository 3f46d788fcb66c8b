//! pause-standby / resume-standby: detach a healthy standby from
//! replication without removing it, and bring it back later.
//!
//! The active site drives both operations under a named lock; the affected
//! standby only waits for its own state to flip before adjusting its local
//! services.

use super::{wait_for_site_state, HandlerContext, OperationHandler};
use crate::config::records::SiteState;
use crate::error::Result;
use async_trait::async_trait;
use tracing::warn;

// =============================================================================
// Pause
// =============================================================================

pub struct PauseStandbyHandler;

#[async_trait]
impl OperationHandler for PauseStandbyHandler {
    fn action(&self) -> &'static str {
        "pause-standby"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let standby = ctx.target_site_id()?.to_string();

        if ctx.is_local(&standby) {
            // Detaching side: wait until the active has finished the flip,
            // then stop pulling replication traffic
            wait_for_site_state(
                ctx,
                &standby,
                &[SiteState::StandbyPaused],
                ctx.timeouts.state_flip,
            )
            .await?;
            ctx.repository.reconfigure_service("replicationsvc").await?;
            return Ok(());
        }
        if !ctx.local_site_is_active().await? {
            return Ok(());
        }

        let lock = ctx.lock("drPauseStandbyLock");
        lock.acquire(ctx.timeouts.lock).await?;
        let result = pause_steps(ctx, &standby).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "pause lock release failed");
        }
        result
    }
}

async fn pause_steps(ctx: &HandlerContext, standby: &str) -> Result<()> {
    ctx.transition_site(
        standby,
        &[SiteState::StandbySynced, SiteState::StandbySyncing],
        SiteState::StandbyPausing,
    )
    .await?;
    ctx.track_operation(standby, "pause-standby", SiteState::StandbyPausing)
        .await?;

    if let Err(e) = ctx.site_control.block_site(standby).await {
        return Err(ctx.step_error(standby, "pause-standby", format!("network block failed: {e}")));
    }
    if let Err(e) = ctx.membership.evict_site(standby).await {
        return Err(ctx.step_error(standby, "pause-standby", format!("eviction failed: {e}")));
    }
    let mut sites = ctx.membership.strategy_options().await?;
    sites.retain(|s| s != standby);
    if let Err(e) = ctx.membership.update_strategy_options(sites).await {
        return Err(ctx.step_error(
            standby,
            "pause-standby",
            format!("strategy update failed: {e}"),
        ));
    }

    ctx.transition_site(standby, &[SiteState::StandbyPausing], SiteState::StandbyPaused)
        .await?;
    Ok(())
}

// =============================================================================
// Resume
// =============================================================================

pub struct ResumeStandbyHandler;

#[async_trait]
impl OperationHandler for ResumeStandbyHandler {
    fn action(&self) -> &'static str {
        "resume-standby"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let standby = ctx.target_site_id()?.to_string();

        if ctx.is_local(&standby) {
            // Rejoining side: wait for readmission, then catch up
            wait_for_site_state(
                ctx,
                &standby,
                &[SiteState::StandbySyncing, SiteState::StandbySynced],
                ctx.timeouts.state_flip,
            )
            .await?;
            ctx.repository.reconfigure_service("replicationsvc").await?;
            ctx.repository
                .set_property("data_revision", &ctx.target.data_revision.to_string())
                .await?;
            ctx.transition_site(
                &standby,
                &[SiteState::StandbySyncing],
                SiteState::StandbySynced,
            )
            .await?;
            return Ok(());
        }
        if !ctx.local_site_is_active().await? {
            return Ok(());
        }

        let lock = ctx.lock("drResumeStandbyLock");
        lock.acquire(ctx.timeouts.lock).await?;
        let result = resume_steps(ctx, &standby).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "resume lock release failed");
        }
        result
    }
}

async fn resume_steps(ctx: &HandlerContext, standby: &str) -> Result<()> {
    ctx.transition_site(
        standby,
        &[SiteState::StandbyPaused],
        SiteState::StandbyResuming,
    )
    .await?;
    ctx.track_operation(standby, "resume-standby", SiteState::StandbyResuming)
        .await?;

    if let Err(e) = ctx.site_control.unblock_site(standby).await {
        return Err(ctx.step_error(standby, "resume-standby", format!("unblock failed: {e}")));
    }
    let mut sites = ctx.membership.strategy_options().await?;
    if !sites.iter().any(|s| s == standby) {
        sites.push(standby.to_string());
        if let Err(e) = ctx.membership.update_strategy_options(sites).await {
            return Err(ctx.step_error(
                standby,
                "resume-standby",
                format!("strategy update failed: {e}"),
            ));
        }
    }

    ctx.transition_site(
        standby,
        &[SiteState::StandbyResuming],
        SiteState::StandbySyncing,
    )
    .await?;
    Ok(())
}
