//! Snapshot types for exporting and hydrating a namespace's state.
//!
//! Snapshots serve inspection and hydration. Records use BTreeMap so that
//! serialization is deterministic; the id lists carry insertion order.

use crate::{
    error::Result, CopyStorage, Error, Fields, Id, Identity, Pagination, PendingTracker, Store,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A copy kept in the store, with the identity it is keyed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCopy {
    pub identity: Identity,
    pub fields: Fields,
}

/// A point-in-time export of one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Namespace the snapshot was taken from
    pub namespace: String,
    /// Permanent ids in insertion order
    pub ids: Vec<Id>,
    pub records: BTreeMap<Id, Fields>,
    /// Temp ids in insertion order
    pub temp_ids: Vec<Id>,
    pub temps: BTreeMap<Id, Fields>,
    /// Only populated when copies are kept in the store
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copies: Vec<SnapshotCopy>,
    #[serde(default)]
    pub pending: PendingTracker,
    #[serde(default)]
    pub pagination: Pagination,
}

impl StoreSnapshot {
    /// Create an empty snapshot.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            namespace: namespace.into(),
            ids: Vec::new(),
            records: BTreeMap::new(),
            temp_ids: Vec::new(),
            temps: BTreeMap::new(),
            copies: Vec::new(),
            pending: PendingTracker::default(),
            pagination: Pagination::default(),
        }
    }

    pub(crate) fn capture(store: &Store) -> Self {
        let mut snapshot = Self::new(store.namespace());
        let table = store.table();

        for id in table.ids() {
            if let Some(record) = table.get(id) {
                snapshot.ids.push(id.clone());
                snapshot.records.insert(id.clone(), record.fields().clone());
            }
        }
        for id in table.temp_ids() {
            if let Some(record) = table.get_temp(id) {
                snapshot.temp_ids.push(id.clone());
                snapshot.temps.insert(id.clone(), record.fields().clone());
            }
        }

        if store.copies().storage() == CopyStorage::InStore {
            snapshot.copies = store
                .copies()
                .iter()
                .map(|(identity, copy)| SnapshotCopy {
                    identity: identity.clone(),
                    fields: copy.fields().clone(),
                })
                .collect();
            snapshot
                .copies
                .sort_by(|a, b| a.identity.to_string().cmp(&b.identity.to_string()));
        }

        snapshot.pending = store.pending().clone();
        snapshot.pagination = store.pagination().clone();
        snapshot
    }

    /// Number of permanent and temporary records.
    pub fn record_count(&self) -> usize {
        self.records.len() + self.temps.len()
    }

    /// Check the snapshot belongs to `namespace` and is self-consistent.
    pub fn validate(&self, namespace: &str) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if self.namespace != namespace {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot of '{}' cannot be imported into '{}'",
                self.namespace, namespace
            )));
        }
        if self.ids.len() != self.records.len()
            || self.ids.iter().any(|id| !self.records.contains_key(id))
        {
            return Err(Error::InvalidSnapshot(
                "record ids do not match records".into(),
            ));
        }
        if self.temp_ids.len() != self.temps.len()
            || self.temp_ids.iter().any(|id| !self.temps.contains_key(id))
        {
            return Err(Error::InvalidSnapshot(
                "temp ids do not match temps".into(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
