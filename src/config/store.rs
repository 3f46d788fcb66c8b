//! Versioned configuration store
//!
//! Persists typed records into the coordination namespace, scoped globally
//! or per-site by each kind's static classification. `persist` is an
//! optimistic create-or-update: a CAS loop that retries on concurrent
//! writers, preserving linearizable per-key semantics without cross-key
//! transactions.

use crate::config::records::{ConfigKind, ConfigRecord, ConfigScope};
use crate::coordination::store::{paths, CoordinationStore};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Bound on CAS retries before surfacing the conflict
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Typed access to persisted configuration
pub struct ConfigStore {
    store: Arc<dyn CoordinationStore>,
    /// Site whose namespace site-scoped kinds resolve to by default
    site_id: String,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn CoordinationStore>, site_id: impl Into<String>) -> Self {
        Self {
            store,
            site_id: site_id.into(),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    fn path_for(&self, kind: ConfigKind, id: &str, site_id: Option<&str>) -> String {
        match kind.scope() {
            ConfigScope::Global => paths::global_config(kind.as_str(), id),
            ConfigScope::Site => {
                paths::site_config(site_id.unwrap_or(&self.site_id), kind.as_str(), id)
            }
        }
    }

    /// Create-if-absent else overwrite, optimistically
    pub async fn persist<T: ConfigRecord>(&self, record: &T) -> Result<()> {
        self.persist_scoped(record, None).await
    }

    /// Persist a site-scoped record into another site's namespace
    pub async fn persist_for_site<T: ConfigRecord>(&self, site_id: &str, record: &T) -> Result<()> {
        self.persist_scoped(record, Some(site_id)).await
    }

    async fn persist_scoped<T: ConfigRecord>(
        &self,
        record: &T,
        site_id: Option<&str>,
    ) -> Result<()> {
        let path = self.path_for(T::KIND, &record.record_id(), site_id);
        let payload = serde_json::to_vec(record)?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.read_node(&path).await?;
            let swapped = self
                .store
                .compare_and_swap(&path, current.as_deref(), &payload)
                .await?;
            if swapped {
                debug!(kind = %T::KIND, path = %path, "config persisted");
                return Ok(());
            }
        }
        Err(Error::VersionConflict { path })
    }

    /// Read one record by id
    pub async fn query<T: ConfigRecord>(&self, id: &str) -> Result<Option<T>> {
        self.query_scoped(id, None).await
    }

    /// Read a site-scoped record from another site's namespace
    pub async fn query_for_site<T: ConfigRecord>(
        &self,
        site_id: &str,
        id: &str,
    ) -> Result<Option<T>> {
        self.query_scoped(id, Some(site_id)).await
    }

    async fn query_scoped<T: ConfigRecord>(
        &self,
        id: &str,
        site_id: Option<&str>,
    ) -> Result<Option<T>> {
        let path = self.path_for(T::KIND, id, site_id);
        match self.store.read_node(&path).await? {
            Some(data) => {
                let record = serde_json::from_slice(&data).map_err(|e| Error::CorruptedRecord {
                    path,
                    reason: e.to_string(),
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Read every record of a kind in its (default) namespace
    pub async fn query_all<T: ConfigRecord>(&self) -> Result<Vec<T>> {
        self.query_all_scoped(None).await
    }

    /// Read every record of a site-scoped kind from another site's namespace
    pub async fn query_all_for_site<T: ConfigRecord>(&self, site_id: &str) -> Result<Vec<T>> {
        self.query_all_scoped(Some(site_id)).await
    }

    async fn query_all_scoped<T: ConfigRecord>(&self, site_id: Option<&str>) -> Result<Vec<T>> {
        let base = match T::KIND.scope() {
            ConfigScope::Global => format!("/config/{}", T::KIND.as_str()),
            ConfigScope::Site => format!(
                "/sites/{}/config/{}",
                site_id.unwrap_or(&self.site_id),
                T::KIND.as_str()
            ),
        };
        let mut records = Vec::new();
        for child in self.store.list_children(&base).await? {
            if let Some(record) = self.query_scoped::<T>(&child, site_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Remove one record; absent records are not an error
    pub async fn remove<T: ConfigRecord>(&self, id: &str) -> Result<()> {
        let path = self.path_for(T::KIND, id, None);
        match self.store.delete_node(&path).await {
            Ok(()) | Err(Error::NodeNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Enumerate the sites that have a site-scoped namespace
    pub async fn known_sites(&self) -> Result<Vec<String>> {
        self.store.list_children("/sites").await
    }
}
