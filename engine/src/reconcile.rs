//! Merging fetched lists and event batches into the entity table.
//!
//! # Algorithm
//!
//! 1. Upsert every incoming record in order (merge in place, or insert)
//! 2. With `auto_remove`, drop permanent records absent from the incoming set
//! 3. Apply removals by both permanent and temporary id
//!
//! The reconciler only touches the entity table. The store cascades removals
//! and promotions to copies and pagination state using the returned result.

use crate::{EntityTable, Flush, Id, Identity, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    /// Records inserted
    pub added: Vec<Identity>,
    /// Records whose stored fields changed
    pub updated: Vec<Identity>,
    /// Records merged without any change
    pub unchanged: Vec<Identity>,
    /// Records removed
    pub removed: Vec<Identity>,
    /// Temp records promoted, as (temporary, permanent) pairs
    pub promoted: Vec<(Identity, Identity)>,
}

impl ReconcileResult {
    /// Whether the table changed at all.
    pub fn is_change(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }

    /// Identities of every record that was inserted or merged.
    pub fn touched(&self) -> impl Iterator<Item = &Identity> {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.unchanged.iter())
    }

    fn absorb(&mut self, other: ReconcileResult) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.unchanged.extend(other.unchanged);
        self.removed.extend(other.removed);
        self.promoted.extend(other.promoted);
    }
}

/// Applies incoming record sets to an entity table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciler {
    auto_remove: bool,
}

impl Reconciler {
    pub fn new(auto_remove: bool) -> Self {
        Self { auto_remove }
    }

    /// Merge a fetched list.
    ///
    /// `auto_remove` applies only to complete lists; pass `paginated` for a
    /// page so records outside it survive.
    pub fn reconcile(
        &self,
        table: &mut EntityTable,
        records: Vec<Record>,
        paginated: bool,
    ) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        let mut seen = HashSet::new();

        for record in records {
            let upserted = table.upsert(record);
            if let Identity::Permanent(id) = &upserted.identity {
                seen.insert(id.clone());
            }
            if let Some(temp) = upserted.promoted_from {
                result
                    .promoted
                    .push((Identity::Temporary(temp), upserted.identity.clone()));
            }
            if upserted.inserted {
                result.added.push(upserted.identity);
            } else if upserted.changed {
                result.updated.push(upserted.identity);
            } else {
                result.unchanged.push(upserted.identity);
            }
        }

        if self.auto_remove && !paginated {
            let stale: Vec<Id> = table
                .ids()
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            for id in stale {
                result.removed.extend(table.remove(&id));
            }
        }

        result
    }

    /// Remove records by both their permanent and temporary ids.
    pub fn remove(&self, table: &mut EntityTable, records: &[Record]) -> ReconcileResult {
        ReconcileResult {
            removed: records
                .iter()
                .flat_map(|record| table.remove_record(record))
                .collect(),
            ..ReconcileResult::default()
        }
    }

    /// Apply a batch of events. Never auto-removes.
    pub fn apply_flush(&self, table: &mut EntityTable, flush: Flush) -> ReconcileResult {
        let mut result = Reconciler::new(false).reconcile(table, flush.upserts, true);
        result.absorb(self.remove(table, &flush.removals));
        result
    }
}
