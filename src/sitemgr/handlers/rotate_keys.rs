//! rotate-keys: roll the inter-site transport keys.
//!
//! Serialized cluster-wide under a named lock so at most one node rewrites
//! its tunnel configuration at a time; the key version tracks the target
//! configuration version, and the key material itself travels in the
//! target's property bag.

use super::{HandlerContext, OperationHandler};
use crate::error::Result;
use async_trait::async_trait;
use tracing::warn;

pub struct RotateKeysHandler;

#[async_trait]
impl OperationHandler for RotateKeysHandler {
    fn action(&self) -> &'static str {
        "rotate-keys"
    }

    async fn execute(&self, ctx: &HandlerContext) -> Result<()> {
        let lock = ctx.lock("drKeyRotationLock");
        lock.acquire(ctx.timeouts.lock).await?;
        let result = rotate(ctx).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "key rotation lock release failed");
        }
        result
    }
}

async fn rotate(ctx: &HandlerContext) -> Result<()> {
    if let Some(key) = ctx.target.properties.get("ipsec.key") {
        ctx.repository.set_property("ipsec.key", key).await?;
    }
    ctx.repository
        .set_property("ipsec.key_version", &ctx.target.config_version.to_string())
        .await?;
    ctx.repository.reconfigure_service("ipsec").await?;
    ctx.repository.restart_service("ipsec").await?;
    Ok(())
}
