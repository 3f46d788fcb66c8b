//! Cluster repair coordinator
//!
//! Drives anti-entropy repair across token ranges under a cluster-wide
//! lock, one driver at a time. Progress is checkpointed to the durable
//! [`RepairJobState`] after every range, so the next holder of the lock
//! resumes mid-run as long as the membership topology digest still matches
//! and the retry budget is not exhausted. A run that finished recently is
//! declined rather than repeated.

use crate::config::store::ConfigStore;
use crate::coordination::lock::DistributedLock;
use crate::coordination::session::CoordinationClient;
use crate::domain::ports::{ClusterMembershipRef, RepairExecutorRef};
use crate::error::{Error, Result};
use crate::repair::state::{RepairJobState, RepairStatus};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct RepairCoordinatorConfig {
    /// A completed run younger than this declines a new one
    pub min_interval: Duration,
    /// Failed attempts tolerated before the checkpoint is abandoned and the
    /// run starts over from token zero
    pub max_retries: u32,
    /// A running job whose last checkpoint is older than this is stalled
    pub stall_threshold: Duration,
    pub lock_timeout: Duration,
    /// How often the background task attempts a run
    pub cycle_interval: Duration,
}

impl Default for RepairCoordinatorConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(24 * 60 * 60),
            max_retries: 3,
            stall_threshold: Duration::from_secs(60 * 60),
            lock_timeout: Duration::from_secs(10),
            cycle_interval: Duration::from_secs(10 * 60),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct RepairCoordinator {
    client: Arc<CoordinationClient>,
    config: Arc<ConfigStore>,
    membership: ClusterMembershipRef,
    executor: RepairExecutorRef,
    settings: RepairCoordinatorConfig,
}

impl RepairCoordinator {
    pub fn new(
        client: Arc<CoordinationClient>,
        config: Arc<ConfigStore>,
        membership: ClusterMembershipRef,
        executor: RepairExecutorRef,
        settings: RepairCoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            membership,
            executor,
            settings,
        })
    }

    /// Attempt one full repair run. Returns the number of ranges repaired
    /// by this call (zero when resumption skipped already-done ranges is
    /// not possible, i.e. a fresh run covers every range).
    pub async fn run_once(&self) -> Result<u32> {
        let digest = self.topology_digest().await?;
        let lock = self.repair_lock();
        lock.acquire(self.settings.lock_timeout).await?;
        let result = self.drive(digest).await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "repair lock release failed");
        }
        result
    }

    async fn drive(&self, digest: u64) -> Result<u32> {
        let mut state = self
            .config
            .query::<RepairJobState>(RepairJobState::ID)
            .await?
            .unwrap_or_default();

        if let Some(end) = state.last_success_end {
            let age = Utc::now().signed_duration_since(end);
            let min = chrono::Duration::from_std(self.settings.min_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
            if state.last_success_digest == Some(digest) && age < min {
                return Err(Error::RepairDeclined(format!(
                    "last successful run completed at {end}"
                )));
            }
        }

        let start_token = if state.resumable(digest, self.settings.max_retries) {
            info!(digest, token = state.current_token, retry = state.current_retry, "resuming repair from checkpoint");
            state.status = RepairStatus::Running;
            state.current_progress = Some(Utc::now());
            state.current_token
        } else {
            info!(digest, "starting fresh repair run");
            state.begin(digest);
            0
        };
        self.config.persist(&state).await?;

        let total = self.executor.range_count();
        let mut repaired = 0;
        for token in start_token..total {
            if let Err(e) = self.executor.repair_range(token).await {
                state.current_retry += 1;
                state.status = RepairStatus::Failed;
                self.config.persist(&state).await?;
                warn!(token, retry = state.current_retry, error = %e, "repair range failed, checkpoint kept");
                return Err(e);
            }
            repaired += 1;
            // Checkpoint before moving on, so a takeover never redoes this
            // range
            state.current_token = token + 1;
            state.current_progress = Some(Utc::now());
            self.config.persist(&state).await?;
        }

        state.complete(digest);
        self.config.persist(&state).await?;
        info!(digest, ranges = total, "repair run completed");
        Ok(repaired)
    }

    /// Abort a stalled run: under the repair lock, mark the dead driver's
    /// checkpoint failed and charge a retry, so the next holder stops
    /// trusting it. Returns [`Error::RepairStalled`] when an abort happened.
    pub async fn abort_if_stalled(&self) -> Result<()> {
        if !self.is_stalled().await? {
            return Ok(());
        }
        let lock = self.repair_lock();
        lock.acquire(self.settings.lock_timeout).await?;
        let result = self.abort_stalled_run().await;
        if let Err(e) = lock.release().await {
            warn!(error = %e, "repair lock release failed");
        }
        result
    }

    async fn abort_stalled_run(&self) -> Result<()> {
        // Re-check under the lock; the driver may have checkpointed since
        if !self.is_stalled().await? {
            return Ok(());
        }
        let Some(mut state) = self
            .config
            .query::<RepairJobState>(RepairJobState::ID)
            .await?
        else {
            return Ok(());
        };
        let stalled_for = state
            .current_progress
            .and_then(|p| Utc::now().signed_duration_since(p).to_std().ok())
            .unwrap_or_default();
        let total = self.executor.range_count().max(1);
        let progress = (state.current_token.min(total) as u64 * 100 / total as u64) as u8;
        state.current_retry += 1;
        state.status = RepairStatus::Failed;
        self.config.persist(&state).await?;
        Err(Error::RepairStalled {
            stalled_for,
            progress,
        })
    }

    /// Whether the durable job claims to be running but has not
    /// checkpointed within the stall threshold
    pub async fn is_stalled(&self) -> Result<bool> {
        let Some(state) = self
            .config
            .query::<RepairJobState>(RepairJobState::ID)
            .await?
        else {
            return Ok(false);
        };
        if state.status != RepairStatus::Running {
            return Ok(false);
        }
        let Some(progress) = state.current_progress else {
            return Ok(false);
        };
        let threshold = chrono::Duration::from_std(self.settings.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        Ok(Utc::now().signed_duration_since(progress) > threshold)
    }

    /// Background task: periodically attempt a run and watch for stalls
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(coordinator.settings.cycle_interval) => {}
                }
                match coordinator.abort_if_stalled().await {
                    Ok(()) => {}
                    Err(e @ Error::RepairStalled { .. }) => {
                        warn!(error = %e, "stalled repair run aborted, checkpoint marked failed");
                    }
                    Err(e) => warn!(error = %e, "repair stall check failed"),
                }
                match coordinator.run_once().await {
                    Ok(ranges) => info!(ranges, "repair cycle finished"),
                    Err(Error::RepairDeclined(reason)) => {
                        info!(%reason, "repair declined");
                    }
                    Err(e) => warn!(error = %e, "repair cycle failed"),
                }
            }
        })
    }

    fn repair_lock(&self) -> DistributedLock {
        DistributedLock::new(
            self.client.store().clone(),
            "clusterRepairLock",
            self.client.node_id(),
        )
    }

    /// Digest of the sorted live membership; any ring change produces a new
    /// digest and invalidates in-flight checkpoints
    async fn topology_digest(&self) -> Result<u64> {
        let mut nodes = self.membership.live_nodes().await?;
        nodes.sort();
        let mut hasher = DefaultHasher::new();
        nodes.hash(&mut hasher);
        Ok(hasher.finish())
    }
}
