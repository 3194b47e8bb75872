//! Identity resolution for records.
//!
//! Every record in the cache carries exactly one identity: a permanent id
//! assigned by the remote side, or a temporary id assigned locally until the
//! record has been created remotely.

use crate::record::Fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default name of the permanent id field.
pub const DEFAULT_ID_FIELD: &str = "id";
/// Default name of the temporary id field.
pub const DEFAULT_TEMP_ID_FIELD: &str = "__id";

/// A record key.
///
/// Ids are keyed by their string form: `42` and `"42"` address the same
/// record. `0` and `""` are valid ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from a field value. `null` is not an id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self(s.clone())),
            other => Some(Self(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Allocate a new process-unique temporary id.
    pub fn temporary() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Id> for Id {
    fn from(value: &Id) -> Self {
        value.clone()
    }
}

macro_rules! id_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Id {
            fn from(value: $t) -> Self {
                Self(value.to_string())
            }
        })*
    };
}

id_from_int!(i32, i64, u32, u64, usize);

/// The resolved identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Identity {
    /// Assigned by the remote side.
    Permanent(Id),
    /// Assigned locally, not yet persisted.
    Temporary(Id),
}

impl Identity {
    pub fn id(&self) -> &Id {
        match self {
            Identity::Permanent(id) | Identity::Temporary(id) => id,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Identity::Temporary(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Identity::Permanent(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Permanent(id) => write!(f, "permanent:{id}"),
            Identity::Temporary(id) => write!(f, "temporary:{id}"),
        }
    }
}

/// Names of the identity fields for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdFields {
    pub id_field: String,
    pub temp_id_field: String,
}

impl Default for IdFields {
    fn default() -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            temp_id_field: DEFAULT_TEMP_ID_FIELD.to_string(),
        }
    }
}

impl IdFields {
    pub fn new(id_field: impl Into<String>, temp_id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            temp_id_field: temp_id_field.into(),
        }
    }

    /// The permanent id: the configured field, then `id`, then `_id`.
    pub fn permanent_id(&self, fields: &Fields) -> Option<Id> {
        [self.id_field.as_str(), "id", "_id"]
            .into_iter()
            .find_map(|name| fields.get(name).and_then(Id::from_value))
    }

    pub fn temp_id(&self, fields: &Fields) -> Option<Id> {
        fields.get(&self.temp_id_field).and_then(Id::from_value)
    }

    /// Resolve identity without modifying the record. A permanent id wins
    /// over a temporary one.
    pub fn identify(&self, fields: &Fields) -> Option<Identity> {
        self.permanent_id(fields)
            .map(Identity::Permanent)
            .or_else(|| self.temp_id(fields).map(Identity::Temporary))
    }

    /// Resolve identity, allocating a temp id when the record has none.
    pub fn ensure_identity(&self, fields: &mut Fields) -> Identity {
        if let Some(identity) = self.identify(fields) {
            return identity;
        }
        let id = Id::temporary();
        fields.insert(
            self.temp_id_field.clone(),
            Value::String(id.as_str().to_string()),
        );
        Identity::Temporary(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn zero_and_empty_string_are_valid_ids() {
        let ids = IdFields::default();
        assert_eq!(
            ids.identify(&fields(json!({"id": 0}))),
            Some(Identity::Permanent(Id::from(0)))
        );
        assert_eq!(
            ids.identify(&fields(json!({"id": ""}))),
            Some(Identity::Permanent(Id::from("")))
        );
    }

    #[test]
    fn null_is_not_an_id() {
        let ids = IdFields::default();
        assert_eq!(ids.identify(&fields(json!({"id": null, "name": "a"}))), None);
    }

    #[test]
    fn numeric_and_string_ids_share_a_key() {
        let ids = IdFields::default();
        let a = ids.permanent_id(&fields(json!({"id": 42}))).unwrap();
        let b = ids.permanent_id(&fields(json!({"id": "42"}))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn falls_back_to_underscore_id() {
        let ids = IdFields::new("uuid", "__id");
        assert_eq!(
            ids.identify(&fields(json!({"_id": "abc"}))),
            Some(Identity::Permanent(Id::from("abc")))
        );
    }

    #[test]
    fn permanent_wins_over_temporary() {
        let ids = IdFields::default();
        let identity = ids.identify(&fields(json!({"id": 1, "__id": "tmp"})));
        assert_eq!(identity, Some(Identity::Permanent(Id::from(1))));
    }

    #[test]
    fn ensure_identity_allocates_unique_temp_ids() {
        let ids = IdFields::default();
        let mut a = Fields::new();
        let mut b = Fields::new();

        let first = ids.ensure_identity(&mut a);
        let second = ids.ensure_identity(&mut b);

        assert!(first.is_temporary());
        assert_ne!(first, second);
        assert_eq!(ids.temp_id(&a).as_ref(), Some(first.id()));
        // Already identified records are left alone
        assert_eq!(ids.ensure_identity(&mut a), first);
    }

    #[test]
    fn identity_serialization_format() {
        let identity = Identity::Temporary(Id::from("abc"));
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, r#"{"kind":"temporary","id":"abc"}"#);
    }
}
