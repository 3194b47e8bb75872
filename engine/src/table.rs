//! The entity table: the normalized record partitions of one namespace.
//!
//! Permanent records live in `by_id` with their ids in insertion order;
//! temporary records live in a separate key space. Stored records are merged
//! in place and never replaced, so their address is stable for as long as
//! they stay in the table.

use crate::{Fields, Id, Identity, Model, Record};
use std::collections::HashMap;

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub identity: Identity,
    /// A new record was inserted (as opposed to merged).
    pub inserted: bool,
    /// Stored fields changed.
    pub changed: bool,
    /// The temp record promoted by this upsert, if any.
    pub promoted_from: Option<Id>,
}

/// Record partitions of one namespace.
#[derive(Debug, Clone)]
pub struct EntityTable {
    model: Model,
    by_id: HashMap<Id, Record>,
    ordered_ids: Vec<Id>,
    temps_by_id: HashMap<Id, Record>,
    temp_order: Vec<Id>,
}

impl EntityTable {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            by_id: HashMap::new(),
            ordered_ids: Vec::new(),
            temps_by_id: HashMap::new(),
            temp_order: Vec::new(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Insert or merge a record, allocating a temp id if it has no identity.
    pub fn upsert(&mut self, record: Record) -> Upserted {
        let mut fields = record.into_fields();
        let identity = self.model.id_fields().ensure_identity(&mut fields);
        match identity {
            Identity::Permanent(id) => {
                let pending_temp = self
                    .model
                    .id_fields()
                    .temp_id(&fields)
                    .filter(|temp| self.temps_by_id.contains_key(temp));
                match pending_temp {
                    Some(temp_id) => self.promote_temp(&temp_id, Record::new(fields)),
                    None => self.upsert_permanent(id, fields),
                }
            }
            Identity::Temporary(id) => self.upsert_temp_fields(id, fields),
        }
    }

    /// Insert or merge a temporary record.
    pub fn upsert_temp(&mut self, record: Record) -> Upserted {
        let mut fields = record.into_fields();
        let id_fields = self.model.id_fields();
        let id = match id_fields.temp_id(&fields) {
            Some(id) => id,
            None => {
                let id = Id::temporary();
                fields.insert(
                    id_fields.temp_id_field.clone(),
                    serde_json::Value::String(id.as_str().to_string()),
                );
                id
            }
        };
        self.upsert_temp_fields(id, fields)
    }

    fn upsert_permanent(&mut self, id: Id, fields: Fields) -> Upserted {
        let identity = Identity::Permanent(id.clone());
        if let Some(existing) = self.by_id.get_mut(&id) {
            let changed = existing.merge_fields(&fields);
            return Upserted {
                identity,
                inserted: false,
                changed,
                promoted_from: None,
            };
        }

        let record = self.model.build(fields);
        self.by_id.insert(id.clone(), record);
        self.ordered_ids.push(id);
        Upserted {
            identity,
            inserted: true,
            changed: true,
            promoted_from: None,
        }
    }

    fn upsert_temp_fields(&mut self, id: Id, fields: Fields) -> Upserted {
        let identity = Identity::Temporary(id.clone());
        if let Some(existing) = self.temps_by_id.get_mut(&id) {
            let changed = existing.merge_fields(&fields);
            return Upserted {
                identity,
                inserted: false,
                changed,
                promoted_from: None,
            };
        }

        let record = self.model.build(fields);
        self.temps_by_id.insert(id.clone(), record);
        self.temp_order.push(id);
        Upserted {
            identity,
            inserted: true,
            changed: true,
            promoted_from: None,
        }
    }

    /// Move a temp record to the permanent partition.
    ///
    /// The permanent data is merged over the temp data and the temp-id field
    /// is dropped. Without a matching temp this is a plain upsert.
    pub fn promote_temp(&mut self, temp_id: &Id, permanent: Record) -> Upserted {
        let temp_field = self.model.id_fields().temp_id_field.clone();
        let mut incoming = permanent.into_fields();
        incoming.shift_remove(&temp_field);

        let Some(temp) = self.remove_temp(temp_id) else {
            return self.upsert(Record::new(incoming));
        };

        let mut fields = temp.into_fields();
        fields.shift_remove(&temp_field);
        for (name, value) in incoming {
            fields.insert(name, value);
        }

        match self.model.id_fields().permanent_id(&fields) {
            Some(id) => {
                let mut upserted = self.upsert_permanent(id, fields);
                upserted.promoted_from = Some(temp_id.clone());
                upserted
            }
            // Nothing to promote to; put it back where it was
            None => {
                fields.insert(
                    temp_field,
                    serde_json::Value::String(temp_id.as_str().to_string()),
                );
                self.upsert_temp_fields(temp_id.clone(), fields)
            }
        }
    }

    /// Remove an id from both partitions. Returns the removed identities.
    pub fn remove(&mut self, id: &Id) -> Vec<Identity> {
        let mut removed = Vec::new();
        if self.by_id.remove(id).is_some() {
            self.ordered_ids.retain(|existing| existing != id);
            removed.push(Identity::Permanent(id.clone()));
        }
        if self.remove_temp(id).is_some() {
            removed.push(Identity::Temporary(id.clone()));
        }
        removed
    }

    /// Remove a record by both its permanent and temporary ids.
    pub fn remove_record(&mut self, record: &Record) -> Vec<Identity> {
        let id_fields = self.model.id_fields();
        let permanent = id_fields.permanent_id(record.fields());
        let temporary = id_fields.temp_id(record.fields());

        let mut removed = Vec::new();
        if let Some(id) = permanent {
            if self.by_id.remove(&id).is_some() {
                self.ordered_ids.retain(|existing| *existing != id);
                removed.push(Identity::Permanent(id));
            }
        }
        if let Some(id) = temporary {
            if self.remove_temp(&id).is_some() {
                removed.push(Identity::Temporary(id));
            }
        }
        removed
    }

    fn remove_temp(&mut self, id: &Id) -> Option<Record> {
        let record = self.temps_by_id.remove(id)?;
        self.temp_order.retain(|existing| existing != id);
        Some(record)
    }

    pub fn get(&self, id: &Id) -> Option<&Record> {
        self.by_id.get(id)
    }

    pub fn get_temp(&self, id: &Id) -> Option<&Record> {
        self.temps_by_id.get(id)
    }

    pub fn find(&self, identity: &Identity) -> Option<&Record> {
        match identity {
            Identity::Permanent(id) => self.by_id.get(id),
            Identity::Temporary(id) => self.temps_by_id.get(id),
        }
    }

    pub fn find_mut(&mut self, identity: &Identity) -> Option<&mut Record> {
        match identity {
            Identity::Permanent(id) => self.by_id.get_mut(id),
            Identity::Temporary(id) => self.temps_by_id.get_mut(id),
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.find(identity).is_some()
    }

    /// Permanent records in insertion order.
    pub fn list(&self) -> impl Iterator<Item = &Record> {
        self.ordered_ids.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Temporary records in insertion order.
    pub fn temps(&self) -> impl Iterator<Item = &Record> {
        self.temp_order.iter().filter_map(|id| self.temps_by_id.get(id))
    }

    pub fn ids(&self) -> &[Id] {
        &self.ordered_ids
    }

    pub fn temp_ids(&self) -> &[Id] {
        &self.temp_order
    }

    /// Count of permanent records.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn temp_len(&self) -> usize {
        self.temps_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.temps_by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.ordered_ids.clear();
        self.temps_by_id.clear();
        self.temp_order.clear();
    }
}
