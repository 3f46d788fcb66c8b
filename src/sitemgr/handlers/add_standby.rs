//! add-standby: attach a new standby site to the replication topology.
//!
//! Every node reconfigures its network and coordination services for the new
//! topology. The active site flips the newcomer to STANDBY_SYNCING and keeps
//! background maintenance off it while it catches up; the newcomer's own
//! nodes declare STANDBY_SYNCED once their local data revision matches the
//! target.

use super::{HandlerContext, OperationHandler};
use crate::config::records::SiteState;
use crate::error::Result;
use async_trait::async_trait;

pub struct AddStandbyHandler;

#[async_trait]
impl OperationHandler for AddStandbyHandler {
    fn action(&self) -> &'static str {
        "add-standby"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let standby = ctx.target_site_id()?.to_string();
        ctx.track_operation(&standby, self.action(), SiteState::StandbySyncing)
            .await?;

        // New topology reaches every node regardless of role
        ctx.repository.reconfigure_service("firewall").await?;
        ctx.repository.reconfigure_service("ipsec").await?;
        ctx.repository.reconfigure_service("coordinatorsvc").await?;

        if ctx.is_local(&standby) {
            ctx.transition_site(&standby, &[SiteState::StandbyAdding], SiteState::StandbySyncing)
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
        } else if ctx.local_site_is_active().await? {
            ctx.transition_site(&standby, &[SiteState::StandbyAdding], SiteState::StandbySyncing)
                .await?;
            // No compaction or repair against a site still catching up
            ctx.repository
                .set_property(&format!("maintenance.disabled.{standby}"), "true")
                .await?;
        }
        Ok(())
    }
}
