//! failover: unplanned promotion of a synced standby after the active site
//! is lost.
//!
//! Only nodes of the promoted site act; the old active is presumed dead and
//! is force-removed from membership and metadata under a named lock. A
//! reboot barrier sized to the site's node count makes every node restart
//! onto the new topology together.

use super::{HandlerContext, OperationHandler, STATE_POLL_INTERVAL};
use crate::config::records::{PrimarySitePointer, Site, SiteState};
use crate::coordination::lock::PersistentLock;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{info, warn};

/// Durable lock serializing the post-promotion node reboots. Held across
/// the reboot itself; the manager releases a leftover hold on restart.
pub const REBOOT_LOCK: &str = "nodeReboot";

pub struct FailoverHandler;

#[async_trait]
impl OperationHandler for FailoverHandler {
    fn action(&self) -> &'static str {
        "failover"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let new_active = ctx.target_site_id()?.to_string();
        if !ctx.is_local(&new_active) {
            // Surviving standbys pick the new topology up afterwards
            return Ok(());
        }

        ctx.track_operation(&new_active, "failover", SiteState::StandbyFailingOver)
            .await?;
        ctx.transition_site(
            &new_active,
            &[SiteState::StandbySynced, SiteState::StandbySyncing],
            SiteState::StandbyFailingOver,
        )
        .await?;

        let lock = ctx.lock("drFailoverLock");
        lock.acquire(ctx.timeouts.lock).await?;
        let result = promote(ctx, &new_active).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "failover lock release failed");
        }
        result?;

        // Whole-site reboot in lockstep onto the promoted topology
        let site = ctx.site(&new_active).await?;
        let barrier = ctx.barrier(
            &format!("failover-reboot-{}", ctx.target.config_version),
            site.node_count,
        );
        barrier
            .await_participants(ctx.node_id(), ctx.timeouts.barrier)
            .await?;

        // The reboots themselves roll one node at a time
        let reboot_lock =
            PersistentLock::new(ctx.client.store().clone(), REBOOT_LOCK, ctx.node_id());
        let started = Instant::now();
        loop {
            match reboot_lock.acquire().await {
                Ok(()) => break,
                Err(Error::LockHeld { .. }) if started.elapsed() < ctx.timeouts.lock => {
                    tokio::time::sleep(STATE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        ctx.repository.reboot().await?;
        // A real reboot does not return; standalone mode does, so hand the
        // lock straight to the next node
        reboot_lock.release().await?;
        Ok(())
    }
}

/// Runs under the failover lock; the first node through does the promotion,
/// later holders see the pointer already flipped and pass straight through
async fn promote(ctx: &HandlerContext, new_active: &str) -> Result<()> {
    let old_active = match ctx.primary_site().await? {
        Some(pointer) if pointer.site_id == new_active => return Ok(()),
        Some(pointer) => Some(pointer.site_id),
        None => None,
    };

    if let Some(old) = old_active.as_deref() {
        if let Err(e) = ctx.membership.evict_site(old).await {
            return Err(ctx.step_error(new_active, "failover", format!("eviction of {old} failed: {e}")));
        }
        let mut sites = ctx.membership.strategy_options().await?;
        sites.retain(|s| s != old);
        if let Err(e) = ctx.membership.update_strategy_options(sites).await {
            return Err(ctx.step_error(
                new_active,
                "failover",
                format!("strategy update failed: {e}"),
            ));
        }
        ctx.config.remove::<Site>(old).await?;
        info!(lost = %old, promoted = %new_active, "old active force-removed");
    }

    ctx.config
        .persist(&PrimarySitePointer::pointing_at(new_active))
        .await?;
    ctx.transition_site(
        new_active,
        &[SiteState::StandbyFailingOver],
        SiteState::Active,
    )
    .await?;
    ctx.site_elector.announce().await?;
    Ok(())
}
