//! Record types for storing data.
//!
//! A record is a JSON object plus a list of accessor descriptors. Accessors
//! are computed fields: when a record is cloned the descriptors are redefined
//! on the clone, so a computed field on a copy reads the copy's own data.

use crate::{error::Result, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Field storage of a record.
pub type Fields = serde_json::Map<String, Value>;

/// Computes an accessor's value from the record it is defined on.
pub type Getter = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
/// Receives values assigned to an accessor field.
pub type Setter = Arc<dyn Fn(&mut Record, Value) + Send + Sync>;

/// A computed field descriptor.
#[derive(Clone)]
pub struct Accessor {
    name: String,
    get: Getter,
    set: Option<Setter>,
}

impl Accessor {
    /// A read-only computed field.
    pub fn getter(
        name: impl Into<String>,
        get: impl Fn(&Record) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            get: Arc::new(get),
            set: None,
        }
    }

    /// Attach a setter, making the field assignable.
    pub fn with_setter(mut self, set: impl Fn(&mut Record, Value) + Send + Sync + 'static) -> Self {
        self.set = Some(Arc::new(set));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_writable(&self) -> bool {
        self.set.is_some()
    }
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("name", &self.name)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// A data record in the store.
///
/// Equality compares stored fields only.
#[derive(Clone, Default)]
pub struct Record {
    fields: Fields,
    accessors: Vec<Accessor>,
    model: Option<Arc<str>>,
    copy: bool,
}

impl Record {
    /// Create a plain record (not a model instance).
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Create a record from a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(Error::invalid_argument(format!(
                "record must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Read a field, evaluating accessors.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.accessor(name) {
            Some(accessor) => Some((accessor.get)(self)),
            None => self.fields.get(name).cloned(),
        }
    }

    /// Read a stored field without evaluating accessors.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Assign a field. Accessor fields go through their setter; assignments
    /// to read-only accessors are ignored.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.accessor(&name).map(|a| a.set.clone()) {
            Some(Some(setter)) => setter(self, value),
            Some(None) => {}
            None => {
                self.fields.insert(name, value);
            }
        }
    }

    /// Remove a stored field.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    pub fn accessors(&self) -> &[Accessor] {
        &self.accessors
    }

    /// Define (or redefine) an accessor on this record.
    pub fn define_accessor(&mut self, accessor: Accessor) {
        self.accessors.retain(|a| a.name != accessor.name);
        self.accessors.push(accessor);
    }

    fn accessor(&self, name: &str) -> Option<&Accessor> {
        self.accessors.iter().find(|a| a.name == name)
    }

    /// Whether this record is a working copy.
    pub fn is_copy(&self) -> bool {
        self.copy
    }

    /// Name of the model that constructed this record, if any.
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub(crate) fn set_model(&mut self, name: Arc<str>) {
        self.model = Some(name);
    }

    /// Plain JSON form of the stored fields.
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Structural merge of incoming fields.
    ///
    /// Each incoming value replaces the current one unless both are equal.
    /// Values are copied, so the record never shares nested structure with
    /// the caller. Returns whether anything changed.
    pub fn merge_fields(&mut self, incoming: &Fields) -> bool {
        let mut changed = false;
        for (name, value) in incoming {
            if let Some(accessor) = self.accessor(name) {
                let setter = accessor.set.clone();
                if let Some(setter) = setter {
                    if self.get(name).as_ref() != Some(value) {
                        setter(self, value.clone());
                        changed = true;
                    }
                }
                continue;
            }
            if self.fields.get(name) != Some(value) {
                self.fields.insert(name.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Merge another record: its fields, plus any accessor this record does
    /// not define yet.
    pub fn merge(&mut self, other: &Record) -> bool {
        for accessor in &other.accessors {
            if self.accessor(&accessor.name).is_none() {
                self.accessors.push(accessor.clone());
            }
        }
        self.merge_fields(&other.fields)
    }

    /// Make this record's stored fields exactly equal to `other`'s.
    pub fn assign_from(&mut self, other: &Record) -> bool {
        let before = self.fields.len();
        self.fields.retain(|name, _| other.fields.contains_key(name));
        let removed = before != self.fields.len();
        let merged = self.merge_fields(&other.fields);
        removed || merged
    }

    /// A structural clone flagged as a working copy.
    pub(crate) fn to_copy(&self) -> Record {
        let mut copy = self.clone();
        copy.copy = true;
        copy
    }

    /// Projection to the named fields. The result is a plain record.
    pub(crate) fn project(&self, names: &[String]) -> Record {
        let mut fields = Fields::new();
        // computed fields come back through the model's accessors
        for name in names {
            if let Some(value) = self.fields.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }
        Record::new(fields)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("fields", &self.fields)
            .field("model", &self.model)
            .field("copy", &self.copy)
            .field(
                "accessors",
                &self.accessors.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl From<Fields> for Record {
    fn from(fields: Fields) -> Self {
        Self::new(fields)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Fields::deserialize(deserializer).map(Record::new)
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
