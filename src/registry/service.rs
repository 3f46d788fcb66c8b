//! Service registry
//!
//! Every process announces an ephemeral record under
//! `/service/<name>/<version>/<nodeId>` on startup; the record disappears
//! automatically if the announcing session dies. Lookups filter by name,
//! version, tag and endpoint key, shuffle the matches for simple load
//! distribution, and prefer endpoints whose address family matches the
//! caller's to avoid cross-stack failures.

use crate::coordination::session::CoordinationClient;
use crate::coordination::store::{paths, CoordinationStore};
use crate::error::{Error, Result};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Records
// =============================================================================

/// Address family the caller's RPC stack runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// One process's registration for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub tags: BTreeSet<String>,
    /// Endpoint key (e.g. "rpc") to URI (e.g. "tcp://10.0.0.1:9160")
    pub endpoints: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn path(&self) -> String {
        format!(
            "{}/{}",
            paths::service(&self.name, &self.version),
            self.node_id
        )
    }
}

/// Resolved endpoint handed to typed RPC clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub service: String,
    pub version: String,
    pub node_id: String,
    pub endpoint_key: String,
    pub uri: String,
}

// =============================================================================
// Registry
// =============================================================================

/// Lookup side of the registry, with a per-process client cache
pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    local_family: AddressFamily,
    /// Keyed by (name, version, tag, endpointKey). Entries are never
    /// proactively invalidated; a caller holding a dead endpoint retries at
    /// a higher level.
    cache: DashMap<(String, String, Option<String>, String), ServiceEndpoint>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, local_family: AddressFamily) -> Self {
        Self {
            store,
            local_family,
            cache: DashMap::new(),
        }
    }

    /// Announce this process's record; re-announced automatically on
    /// reconnect through the client's presence tracking
    pub async fn register(&self, client: &CoordinationClient, record: &ServiceRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        client.announce_ephemeral(&record.path(), &payload).await?;
        debug!(service = %record.name, version = %record.version, node = %record.node_id, "service registered");
        Ok(())
    }

    /// All live matching records, shuffled
    pub async fn locate_all_services(
        &self,
        name: &str,
        version: &str,
        tag: Option<&str>,
        endpoint_key: &str,
    ) -> Result<Vec<ServiceRecord>> {
        let base = paths::service(name, version);
        let mut records = Vec::new();
        for child in self.store.list_children(&base).await? {
            let path = format!("{base}/{child}");
            let Some(data) = self.store.read_node(&path).await? else {
                continue; // registration vanished between list and read
            };
            let record: ServiceRecord =
                serde_json::from_slice(&data).map_err(|e| Error::CorruptedRecord {
                    path,
                    reason: e.to_string(),
                })?;
            let tag_matches = tag.map(|t| record.tags.contains(t)).unwrap_or(true);
            if tag_matches && record.endpoints.contains_key(endpoint_key) {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(Error::ServiceNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        records.shuffle(&mut rand::thread_rng());
        Ok(records)
    }

    /// One resolved endpoint, cached per (name, version, tag, endpointKey)
    pub async fn locate_service(
        &self,
        name: &str,
        version: &str,
        tag: Option<&str>,
        endpoint_key: &str,
    ) -> Result<ServiceEndpoint> {
        let cache_key = (
            name.to_string(),
            version.to_string(),
            tag.map(str::to_string),
            endpoint_key.to_string(),
        );
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }

        let records = self
            .locate_all_services(name, version, tag, endpoint_key)
            .await?;
        let chosen = records
            .iter()
            .find(|r| {
                r.endpoints
                    .get(endpoint_key)
                    .map(|uri| family_matches(uri, self.local_family))
                    .unwrap_or(false)
            })
            .or_else(|| records.first())
            .ok_or_else(|| Error::EndpointUnresolvable {
                name: name.to_string(),
                endpoint_key: endpoint_key.to_string(),
            })?;

        let endpoint = ServiceEndpoint {
            service: chosen.name.clone(),
            version: chosen.version.clone(),
            node_id: chosen.node_id.clone(),
            endpoint_key: endpoint_key.to_string(),
            uri: chosen.endpoints[endpoint_key].clone(),
        };
        self.cache.insert(cache_key, endpoint.clone());
        Ok(endpoint)
    }
}

/// Whether a URI's host address belongs to the given family. Hostnames are
/// family-neutral and match either.
fn family_matches(uri: &str, family: AddressFamily) -> bool {
    let authority = uri.split("://").nth(1).unwrap_or(uri);
    match authority.parse::<SocketAddr>() {
        Ok(addr) => match family {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordination;

    fn record(node: &str, uri: &str, tags: &[&str]) -> ServiceRecord {
        ServiceRecord {
            name: "syssvc".into(),
            version: "1".into(),
            node_id: node.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            endpoints: BTreeMap::from([("rpc".to_string(), uri.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_register_and_locate_all() {
        let cluster = MemoryCoordination::new();
        let session = cluster.connect();
        let client = CoordinationClient::new(session.clone(), "site-1", "node-1");
        let registry = ServiceRegistry::new(session, AddressFamily::Ipv4);

        registry
            .register(&client, &record("node-1", "tcp://10.0.0.1:9160", &["dr"]))
            .await
            .unwrap();
        registry
            .register(&client, &record("node-2", "tcp://10.0.0.2:9160", &[]))
            .await
            .unwrap();

        let all = registry
            .locate_all_services("syssvc", "1", None, "rpc")
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let tagged = registry
            .locate_all_services("syssvc", "1", Some("dr"), "rpc")
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].node_id, "node-1");
    }

    #[tokio::test]
    async fn test_dead_session_record_disappears() {
        let cluster = MemoryCoordination::new();
        let dying = cluster.connect();
        let dying_id = dying.session_id();
        let dying_client = CoordinationClient::new(dying.clone(), "site-1", "node-1");
        let registry = ServiceRegistry::new(dying, AddressFamily::Ipv4);
        registry
            .register(&dying_client, &record("node-1", "tcp://10.0.0.1:9160", &[]))
            .await
            .unwrap();

        cluster.expire_session(dying_id);

        let observer = ServiceRegistry::new(cluster.connect(), AddressFamily::Ipv4);
        assert!(matches!(
            observer.locate_all_services("syssvc", "1", None, "rpc").await,
            Err(Error::ServiceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_locate_service_prefers_local_family() {
        let cluster = MemoryCoordination::new();
        let session = cluster.connect();
        let client = CoordinationClient::new(session.clone(), "site-1", "node-1");
        let registry = ServiceRegistry::new(session, AddressFamily::Ipv6);

        registry
            .register(&client, &record("node-v4", "tcp://10.0.0.1:9160", &[]))
            .await
            .unwrap();
        registry
            .register(&client, &record("node-v6", "tcp://[fd00::1]:9160", &[]))
            .await
            .unwrap();

        let endpoint = registry
            .locate_service("syssvc", "1", None, "rpc")
            .await
            .unwrap();
        assert_eq!(endpoint.node_id, "node-v6");
    }

    #[tokio::test]
    async fn test_locate_service_cache_is_never_evicted() {
        let cluster = MemoryCoordination::new();
        let session = cluster.connect();
        let client = CoordinationClient::new(session.clone(), "site-1", "node-1");
        let registry = ServiceRegistry::new(session.clone(), AddressFamily::Ipv4);

        registry
            .register(&client, &record("node-1", "tcp://10.0.0.1:9160", &[]))
            .await
            .unwrap();
        let first = registry
            .locate_service("syssvc", "1", None, "rpc")
            .await
            .unwrap();

        // Registration goes away, but the cached endpoint is still served
        session.delete_node(&record("node-1", "", &[]).path()).await.unwrap();
        let second = registry
            .locate_service("syssvc", "1", None, "rpc")
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
