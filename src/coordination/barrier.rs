//! Distributed barriers
//!
//! [`DistributedBarrier`] gates an action until N participants have
//! registered. [`DistributedDoubleBarrier`] additionally gates the exit:
//! nobody finishes until everybody has signalled completion, bounding skew
//! between nodes during a topology change.
//!
//! Both are all-or-nothing: a participant that times out withdraws its
//! registration, so partial arrival (N-1 of N) never unblocks anyone.

use crate::coordination::store::{paths, CoordinationStore, CreateMode};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn member_path(name: &str, participant_id: &str) -> String {
    format!("{}/member-{}", paths::barrier(name), participant_id)
}

fn ready_path(name: &str) -> String {
    format!("{}/ready", paths::barrier(name))
}

// =============================================================================
// Single Barrier
// =============================================================================

/// Entry-only barrier: blocks until all N participants have registered
pub struct DistributedBarrier {
    store: Arc<dyn CoordinationStore>,
    name: String,
    required: u32,
}

impl DistributedBarrier {
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>, required: u32) -> Self {
        Self {
            store,
            name: name.into(),
            required: required.max(1),
        }
    }

    /// Register and wait until all participants have arrived
    pub async fn await_participants(&self, participant_id: &str, timeout: Duration) -> Result<()> {
        enter(
            &*self.store,
            &self.name,
            participant_id,
            self.required,
            timeout,
        )
        .await
    }

    /// Number of currently registered participants
    pub async fn arrived(&self) -> Result<u32> {
        arrived(&*self.store, &self.name).await
    }
}

// =============================================================================
// Double Barrier
// =============================================================================

/// Enter/leave barrier for two-phase group operations
pub struct DistributedDoubleBarrier {
    store: Arc<dyn CoordinationStore>,
    name: String,
    required: u32,
    participant_id: String,
}

impl DistributedDoubleBarrier {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        participant_id: impl Into<String>,
        required: u32,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            required: required.max(1),
            participant_id: participant_id.into(),
        }
    }

    /// Phase 1: register readiness and wait for the full group
    pub async fn enter(&self, timeout: Duration) -> Result<()> {
        enter(
            &*self.store,
            &self.name,
            &self.participant_id,
            self.required,
            timeout,
        )
        .await
    }

    /// Phase 2: signal completion and wait until the whole group has left
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        match self
            .store
            .delete_node(&member_path(&self.name, &self.participant_id))
            .await
        {
            Ok(()) | Err(Error::NodeNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        loop {
            let remaining = arrived(&*self.store, &self.name).await?;
            if remaining == 0 {
                // Last one out clears the ready flag; racing leavers
                // tolerate the repeated delete
                match self.store.delete_node(&ready_path(&self.name)).await {
                    Ok(()) | Err(Error::NodeNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                debug!(barrier = %self.name, participant = %self.participant_id, "double barrier completed");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    operation: format!("leave barrier {}", self.name),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// =============================================================================
// Shared Enter/Count Logic
// =============================================================================

async fn enter(
    store: &dyn CoordinationStore,
    name: &str,
    participant_id: &str,
    required: u32,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let path = member_path(name, participant_id);
    let ready = ready_path(name);
    match store
        .create_node(&path, participant_id.as_bytes(), CreateMode::Ephemeral)
        .await
    {
        // Re-entry after a crash within the same session is fine
        Ok(_) | Err(Error::NodeExists { .. }) => {}
        Err(e) => return Err(e),
    }
    debug!(barrier = %name, participant = %participant_id, "entered barrier");

    loop {
        // The ready flag outlives early registrations: a laggard must
        // still be released after a fast peer has already moved on to
        // leaving and withdrawn its member node
        if store.read_node(&ready).await?.is_some() {
            return Ok(());
        }
        let count = arrived(store, name).await?;
        if count >= required {
            match store.create_node(&ready, &[], CreateMode::Persistent).await {
                Ok(_) | Err(Error::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
            return Ok(());
        }
        if started.elapsed() >= timeout {
            // Withdraw so partial arrival never releases anyone
            let _ = store.delete_node(&path).await;
            return Err(Error::BarrierIncomplete {
                name: name.to_string(),
                arrived: count,
                required,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn arrived(store: &dyn CoordinationStore, name: &str) -> Result<u32> {
    let children = store.list_children(&paths::barrier(name)).await?;
    Ok(children.iter().filter(|c| c.starts_with("member-")).count() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordination;

    #[tokio::test]
    async fn test_full_group_releases_together() {
        let cluster = MemoryCoordination::new();
        let mut tasks = Vec::new();
        for i in 1..=3 {
            let barrier = DistributedBarrier::new(cluster.connect(), "flip", 3);
            tasks.push(tokio::spawn(async move {
                barrier
                    .await_participants(&format!("node-{i}"), Duration::from_secs(5))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_partial_arrival_never_unblocks() {
        let cluster = MemoryCoordination::new();
        let a = DistributedBarrier::new(cluster.connect(), "flip", 3);
        let b = DistributedBarrier::new(cluster.connect(), "flip", 3);

        let ra = tokio::spawn(async move {
            a.await_participants("node-1", Duration::from_millis(150)).await
        });
        let rb = tokio::spawn(async move {
            b.await_participants("node-2", Duration::from_millis(150)).await
        });

        // 2 of 3 arrived: both time out, neither is released
        assert!(matches!(
            ra.await.unwrap(),
            Err(Error::BarrierIncomplete { required: 3, .. })
        ));
        assert!(matches!(
            rb.await.unwrap(),
            Err(Error::BarrierIncomplete { required: 3, .. })
        ));

        // Withdrawals leave the barrier empty
        let probe = DistributedBarrier::new(cluster.connect(), "flip", 3);
        assert_eq!(probe.arrived().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_barrier_enter_and_leave() {
        let cluster = MemoryCoordination::new();
        let mut tasks = Vec::new();
        for i in 1..=3 {
            let barrier = DistributedDoubleBarrier::new(
                cluster.connect(),
                "data-revision",
                format!("node-{i}"),
                3,
            );
            tasks.push(tokio::spawn(async move {
                barrier.enter(Duration::from_secs(5)).await?;
                // Work phase happens here
                barrier.leave(Duration::from_secs(5)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_leave_blocks_until_all_have_left() {
        let cluster = MemoryCoordination::new();
        let a = DistributedDoubleBarrier::new(cluster.connect(), "switchover", "node-1", 2);
        let b = DistributedDoubleBarrier::new(cluster.connect(), "switchover", "node-2", 2);

        let ea = tokio::spawn(async move {
            a.enter(Duration::from_secs(5)).await.unwrap();
            a
        });
        b.enter(Duration::from_secs(5)).await.unwrap();
        let a = ea.await.unwrap();

        // node-1 leaves but node-2 has not: leave must block
        let err = a.leave(Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_timeout());

        let la = tokio::spawn(async move { a.leave(Duration::from_secs(5)).await });
        b.leave(Duration::from_secs(5)).await.unwrap();
        la.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_error_reports_observed_arrivals() {
        let cluster = MemoryCoordination::new();
        let barrier = DistributedBarrier::new(cluster.connect(), "flip", 3);
        let err = barrier
            .await_participants("node-1", Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            Error::BarrierIncomplete { arrived, required, .. } => {
                assert_eq!(arrived, 1);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_late_poller_passes_after_fast_peer_starts_leaving() {
        let cluster = MemoryCoordination::new();

        // node-1 has registered but not yet observed the full group
        let session = cluster.connect();
        session
            .create_node(
                "/barrier/upgrade/member-node-1",
                b"node-1",
                CreateMode::Ephemeral,
            )
            .await
            .unwrap();

        // node-2 sees both members, passes, and immediately starts leaving,
        // withdrawing its own member node
        let fast = DistributedDoubleBarrier::new(cluster.connect(), "upgrade", "node-2", 2);
        fast.enter(Duration::from_secs(1)).await.unwrap();
        let fast_leave = tokio::spawn(async move { fast.leave(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // node-1 only now starts polling; the full count is no longer
        // observable, so the ready flag is what lets it through
        let slow = DistributedDoubleBarrier::new(cluster.connect(), "upgrade", "node-1", 2);
        slow.enter(Duration::from_millis(500)).await.unwrap();
        slow.leave(Duration::from_secs(5)).await.unwrap();
        fast_leave.await.unwrap().unwrap();

        // The round cleaned up after itself
        let observer = cluster.connect();
        assert!(observer
            .list_children("/barrier/upgrade")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reentry_is_idempotent() {
        let cluster = MemoryCoordination::new();
        let barrier = DistributedBarrier::new(cluster.connect(), "flip", 1);
        barrier
            .await_participants("node-1", Duration::from_secs(1))
            .await
            .unwrap();
        // Same participant re-enters after a crash-and-rerun
        barrier
            .await_participants("node-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(barrier.arrived().await.unwrap(), 1);
    }
}
