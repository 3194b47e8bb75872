//! Working copies of cached records.
//!
//! A copy is an isolated structural clone of one record, keyed by the same
//! identity as its source. There is at most one copy per identity: cloning
//! again returns the existing copy with the overrides merged in.

use crate::{error::Result, EntityTable, Error, Fields, IdFields, Identity, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where copies are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CopyStorage {
    /// In a side table that is not part of exported state.
    #[default]
    Side,
    /// Inside the store state, exported with snapshots.
    InStore,
}

/// Registry of working copies for one namespace.
#[derive(Debug, Clone, Default)]
pub struct CopyManager {
    storage: CopyStorage,
    copies: HashMap<Identity, Record>,
}

impl CopyManager {
    pub fn new(storage: CopyStorage) -> Self {
        Self {
            storage,
            copies: HashMap::new(),
        }
    }

    pub fn storage(&self) -> CopyStorage {
        self.storage
    }

    /// Return the copy for `identity`, creating it from the table's record
    /// if none exists yet.
    pub fn clone_of(
        &mut self,
        table: &EntityTable,
        identity: &Identity,
        overrides: Option<&Fields>,
    ) -> Result<&Record> {
        if !self.copies.contains_key(identity) {
            let source = table
                .find(identity)
                .ok_or_else(|| Error::RecordNotFound(identity.to_string()))?;
            self.copies.insert(identity.clone(), source.to_copy());
        }

        let copy = self
            .copies
            .get_mut(identity)
            .ok_or_else(|| Error::RecordNotFound(identity.to_string()))?;
        if let Some(overrides) = overrides {
            copy.merge_fields(overrides);
        }
        Ok(&*copy)
    }

    /// Discard the copy's edits by re-cloning from the current source.
    pub fn reset(&mut self, table: &EntityTable, identity: &Identity) -> Result<&Record> {
        if !self.copies.contains_key(identity) {
            return Err(Error::invalid_operation(format!(
                "{identity} has no copy to reset"
            )));
        }
        let Some(source) = table.find(identity) else {
            self.copies.remove(identity);
            return Err(Error::RecordNotFound(identity.to_string()));
        };

        let copy = source.to_copy();
        self.copies.insert(identity.clone(), copy);
        self.copies
            .get(identity)
            .ok_or_else(|| Error::RecordNotFound(identity.to_string()))
    }

    /// Write the copy into its source and discard it.
    ///
    /// The source's fields become exactly the copy's fields. If the source
    /// is gone the copy's data is inserted as a new record.
    pub fn commit(&mut self, table: &mut EntityTable, identity: &Identity) -> Result<Identity> {
        let copy = self.copies.remove(identity).ok_or_else(|| {
            Error::invalid_operation(format!("{identity} has no copy to commit"))
        })?;

        match table.find_mut(identity) {
            Some(source) => {
                source.assign_from(&copy);
                Ok(identity.clone())
            }
            None => Ok(table.upsert(Record::new(copy.into_fields())).identity),
        }
    }

    /// Replace the registered copy's data with an edited copy.
    pub fn put(&mut self, identity: &Identity, edited: &Record) -> Result<&Record> {
        if !edited.is_copy() {
            return Err(Error::invalid_operation("record is not a copy"));
        }
        let copy = self.copies.get_mut(identity).ok_or_else(|| {
            Error::invalid_operation(format!("{identity} has no registered copy"))
        })?;
        copy.assign_from(edited);
        Ok(&*copy)
    }

    /// Remove a copy without touching its source.
    pub fn discard(&mut self, identity: &Identity) -> Option<Record> {
        self.copies.remove(identity)
    }

    /// Move a copy to a new key when its temp source is promoted, taking
    /// over the promoted record's id value.
    pub fn rekey(
        &mut self,
        from: &Identity,
        to: &Identity,
        id_fields: &IdFields,
        id_value: Option<&Value>,
    ) {
        if let Some(mut copy) = self.copies.remove(from) {
            copy.remove(&id_fields.temp_id_field);
            if let Some(value) = id_value {
                copy.set(id_fields.id_field.clone(), value.clone());
            }
            self.copies.insert(to.clone(), copy);
        }
    }

    /// Register a copy restored from a snapshot.
    pub(crate) fn restore(&mut self, identity: Identity, record: Record) {
        self.copies.insert(identity, record.to_copy());
    }

    pub fn get(&self, identity: &Identity) -> Option<&Record> {
        self.copies.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut Record> {
        self.copies.get_mut(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.copies.contains_key(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Record)> {
        self.copies.iter()
    }

    pub fn len(&self) -> usize {
        self.copies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    pub fn clear(&mut self) {
        self.copies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Id, Model};
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn setup() -> (EntityTable, CopyManager, Identity) {
        let mut table = EntityTable::new(Model::new("Item"));
        let identity = table.upsert(record(json!({"id": 1, "name": "a"}))).identity;
        (table, CopyManager::new(CopyStorage::Side), identity)
    }

    #[test]
    fn cloning_twice_returns_the_same_copy() {
        let (table, mut copies, identity) = setup();

        copies.clone_of(&table, &identity, None).unwrap();
        let overrides = record(json!({"name": "b"}));
        let copy = copies
            .clone_of(&table, &identity, Some(overrides.fields()))
            .unwrap();

        assert_eq!(copy.field("name"), Some(&json!("b")));
        assert!(copy.is_copy());
        assert_eq!(copies.len(), 1);
        // Source untouched
        assert_eq!(table.find(&identity).unwrap().field("name"), Some(&json!("a")));
    }

    #[test]
    fn reset_restores_source_fields() {
        let (table, mut copies, identity) = setup();
        copies.clone_of(&table, &identity, None).unwrap();
        copies
            .get_mut(&identity)
            .unwrap()
            .set("extra", json!(true));

        let reset = copies.reset(&table, &identity).unwrap();
        assert_eq!(reset, table.find(&identity).unwrap());
        assert!(reset.is_copy());
    }

    #[test]
    fn commit_writes_source_and_discards_copy() {
        let (mut table, mut copies, identity) = setup();
        copies.clone_of(&table, &identity, None).unwrap();
        let copy = copies.get_mut(&identity).unwrap();
        copy.set("name", json!("edited"));

        copies.commit(&mut table, &identity).unwrap();

        assert!(copies.get(&identity).is_none());
        assert_eq!(
            table.find(&identity).unwrap().to_json(),
            json!({"id": 1, "name": "edited"})
        );
    }

    #[test]
    fn commit_and_reset_require_a_copy() {
        let (mut table, mut copies, identity) = setup();
        assert!(matches!(
            copies.commit(&mut table, &identity),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            copies.reset(&table, &identity),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn cloning_unknown_record_fails() {
        let (table, mut copies, _) = setup();
        let missing = Identity::Permanent(Id::from(9));
        assert!(matches!(
            copies.clone_of(&table, &missing, None),
            Err(Error::RecordNotFound(_))
        ));
    }

    #[test]
    fn rekey_moves_copy_to_permanent_identity() {
        let mut table = EntityTable::new(Model::new("Item"));
        let temp = table.upsert(record(json!({"name": "draft"}))).identity;
        let mut copies = CopyManager::default();
        copies.clone_of(&table, &temp, None).unwrap();

        let permanent = Identity::Permanent(Id::from(3));
        copies.rekey(&temp, &permanent, &IdFields::default(), Some(&json!(3)));

        assert!(copies.get(&temp).is_none());
        let copy = copies.get(&permanent).unwrap();
        assert_eq!(copy.field("id"), Some(&json!(3)));
        assert!(copy.field("__id").is_none());
    }
}
