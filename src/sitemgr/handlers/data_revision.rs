//! change-data-revision: flip a site's data revision marker on every node
//! at once, or on none of them.
//!
//! Two-phase commit over a double barrier. Entering the barrier is the
//! prepare vote; a node that cannot enter aborts before anything durable
//! happens. Leaving is the commit point; a node whose leave times out rolls
//! its prepare marker back so a fresh round can start cleanly.

use super::{HandlerContext, OperationHandler};
use crate::error::Result;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ChangeDataRevisionHandler;

#[async_trait]
impl OperationHandler for ChangeDataRevisionHandler {
    fn action(&self) -> &'static str {
        "change-data-revision"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let revision = ctx.target.data_revision.to_string();
        if ctx.repository.get_property("data_revision").await?.as_deref() == Some(&revision) {
            return Ok(());
        }

        let site = ctx.site(ctx.local_site_id()).await?;
        let barrier = ctx.double_barrier(
            &format!("data-revision-{revision}-{}", ctx.local_site_id()),
            site.node_count,
        );

        // Phase 1: nothing durable until the whole site is present
        barrier.enter(ctx.timeouts.barrier).await?;
        ctx.repository
            .set_property("data_revision_pending", &revision)
            .await?;

        // Phase 2: leave completing means every node prepared
        match barrier.leave(ctx.timeouts.barrier).await {
            Ok(()) => {
                ctx.repository.set_property("data_revision", &revision).await?;
                ctx.repository.set_property("data_revision_pending", "").await?;
                ctx.repository.restart_service("dbsvc").await?;
                info!(revision = %revision, "data revision committed");
                Ok(())
            }
            Err(e) => {
                warn!(revision = %revision, error = %e, "data revision round aborted, rolling back prepare");
                ctx.repository.set_property("data_revision_pending", "").await?;
                Err(e)
            }
        }
    }
}
