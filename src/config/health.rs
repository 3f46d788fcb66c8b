//! Derived cluster health
//!
//! Cluster state is never stored: it is recomputed on demand by comparing
//! every node's published observed configuration against the target, and
//! classified by which subset differs.

use crate::config::records::{PowerOffState, RepositoryInfo, TargetInfo};
use serde::{Deserialize, Serialize};

/// Health classification of one site's cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterState {
    Stable,
    Degraded,
    Syncing,
    Upgrading,
    Updating,
    PoweringOff,
    Unknown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Stable => "STABLE",
            ClusterState::Degraded => "DEGRADED",
            ClusterState::Syncing => "SYNCING",
            ClusterState::Upgrading => "UPGRADING",
            ClusterState::Updating => "UPDATING",
            ClusterState::PoweringOff => "POWERINGOFF",
            ClusterState::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Classify cluster health from target vs observed state
///
/// Precedence: an in-flight power-off dominates, then missing nodes, then
/// software-version skew, then property-config skew, then data-revision
/// skew. All observations matching the target is STABLE.
pub fn derive_cluster_state(
    target: &TargetInfo,
    observed: &[RepositoryInfo],
    expected_nodes: u32,
) -> ClusterState {
    if target.power_off != PowerOffState::None {
        return ClusterState::PoweringOff;
    }
    if observed.is_empty() {
        return ClusterState::Unknown;
    }
    if (observed.len() as u32) < expected_nodes {
        return ClusterState::Degraded;
    }
    if observed
        .iter()
        .any(|node| node.software_version != target.software_version)
    {
        return ClusterState::Upgrading;
    }
    if observed
        .iter()
        .any(|node| node.config_version != target.config_version)
    {
        return ClusterState::Updating;
    }
    if observed
        .iter()
        .any(|node| node.data_revision != target.data_revision)
    {
        return ClusterState::Syncing;
    }
    ClusterState::Stable
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observed(node_id: &str, software: &str, config: u64, revision: u64) -> RepositoryInfo {
        RepositoryInfo {
            node_id: node_id.into(),
            site_id: "site-1".into(),
            software_version: software.into(),
            config_version: config,
            data_revision: revision,
            published_at: Utc::now(),
        }
    }

    fn target() -> TargetInfo {
        let mut t = TargetInfo::initial("3.6.2");
        t.config_version = 4;
        t.data_revision = 2;
        t
    }

    #[test]
    fn test_stable_when_all_match() {
        let nodes = vec![
            observed("node-1", "3.6.2", 4, 2),
            observed("node-2", "3.6.2", 4, 2),
        ];
        assert_eq!(
            derive_cluster_state(&target(), &nodes, 2),
            ClusterState::Stable
        );
    }

    #[test]
    fn test_classification_by_differing_subset() {
        let t = target();

        let nodes = vec![
            observed("node-1", "3.6.2", 4, 2),
            observed("node-2", "3.7.0", 4, 2),
        ];
        assert_eq!(derive_cluster_state(&t, &nodes, 2), ClusterState::Upgrading);

        let nodes = vec![
            observed("node-1", "3.6.2", 4, 2),
            observed("node-2", "3.6.2", 3, 2),
        ];
        assert_eq!(derive_cluster_state(&t, &nodes, 2), ClusterState::Updating);

        let nodes = vec![
            observed("node-1", "3.6.2", 4, 2),
            observed("node-2", "3.6.2", 4, 1),
        ];
        assert_eq!(derive_cluster_state(&t, &nodes, 2), ClusterState::Syncing);
    }

    #[test]
    fn test_degraded_unknown_and_poweroff() {
        let t = target();
        let nodes = vec![observed("node-1", "3.6.2", 4, 2)];
        assert_eq!(derive_cluster_state(&t, &nodes, 3), ClusterState::Degraded);
        assert_eq!(derive_cluster_state(&t, &[], 3), ClusterState::Unknown);

        let mut powering = t.clone();
        powering.power_off = PowerOffState::Graceful;
        assert_eq!(
            derive_cluster_state(&powering, &nodes, 1),
            ClusterState::PoweringOff
        );
    }
}
