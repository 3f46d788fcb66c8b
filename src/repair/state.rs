//! Durable repair job state
//!
//! A single cluster-wide record checkpoints anti-entropy repair progress so
//! a run interrupted by a crash or failover resumes from its last completed
//! token range instead of starting over.

use crate::config::records::{ConfigKind, ConfigRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    #[default]
    Idle,
    Running,
    Failed,
}

/// Checkpointed progress of the cluster repair job
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepairJobState {
    /// Topology digest the in-flight run was started against
    pub current_digest: Option<u64>,
    /// Next token range to repair
    pub current_token: u32,
    /// Failed attempts against the current digest
    pub current_retry: u32,
    pub current_started: Option<DateTime<Utc>>,
    /// Timestamp of the most recent completed range, fed to the stall watch
    pub current_progress: Option<DateTime<Utc>>,
    pub last_success_digest: Option<u64>,
    pub last_success_start: Option<DateTime<Utc>>,
    pub last_success_end: Option<DateTime<Utc>>,
    pub status: RepairStatus,
}

impl RepairJobState {
    pub const ID: &'static str = "cluster";

    /// Whether a run against `digest` can pick up where it left off
    pub fn resumable(&self, digest: u64, max_retries: u32) -> bool {
        self.current_digest == Some(digest)
            && self.current_retry < max_retries
            && self.current_token > 0
    }

    /// Reset for a fresh run against a (possibly new) topology
    pub fn begin(&mut self, digest: u64) {
        self.current_digest = Some(digest);
        self.current_token = 0;
        self.current_retry = 0;
        self.current_started = Some(Utc::now());
        self.current_progress = Some(Utc::now());
        self.status = RepairStatus::Running;
    }

    /// Mark the run complete and roll the success markers forward
    pub fn complete(&mut self, digest: u64) {
        self.last_success_digest = Some(digest);
        self.last_success_start = self.current_started;
        self.last_success_end = Some(Utc::now());
        self.current_digest = None;
        self.current_token = 0;
        self.current_retry = 0;
        self.current_started = None;
        self.current_progress = None;
        self.status = RepairStatus::Idle;
    }
}

impl ConfigRecord for RepairJobState {
    const KIND: ConfigKind = ConfigKind::RepairJobState;

    fn record_id(&self) -> String {
        Self::ID.to_string()
    }
}
