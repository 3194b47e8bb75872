//! Pending and error state per namespace.
//!
//! Mutations are tracked per record identity; `find` and `get` are tracked as
//! namespace-wide flags. Each method keeps its last error.
//!
//! Overlapping operations of the same kind on the same id share one set
//! entry: the first one to settle clears the flag even while the others are
//! still in flight.

use crate::{Identity, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// An error reported by the transport, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{name}: {message}")]
pub struct TransportError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TransportError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            data: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NotFound", message).with_code(404)
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new("GeneralError", message).with_code(500)
    }
}

/// Pending flags and last errors for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTracker {
    is_find_pending: bool,
    is_get_pending: bool,
    create: HashSet<Identity>,
    update: HashSet<Identity>,
    patch: HashSet<Identity>,
    remove: HashSet<Identity>,
    errors: BTreeMap<Method, TransportError>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self, method: Method) -> Option<&HashSet<Identity>> {
        match method {
            Method::Create => Some(&self.create),
            Method::Update => Some(&self.update),
            Method::Patch => Some(&self.patch),
            Method::Remove => Some(&self.remove),
            Method::Find | Method::Get => None,
        }
    }

    fn ids_mut(&mut self, method: Method) -> Option<&mut HashSet<Identity>> {
        match method {
            Method::Create => Some(&mut self.create),
            Method::Update => Some(&mut self.update),
            Method::Patch => Some(&mut self.patch),
            Method::Remove => Some(&mut self.remove),
            Method::Find | Method::Get => None,
        }
    }

    /// Enter the pending state. Saves also clear the method's last error.
    pub fn begin(&mut self, method: Method, identity: Option<&Identity>) {
        match method {
            Method::Find => self.is_find_pending = true,
            Method::Get => self.is_get_pending = true,
            _ => {
                if let (Some(ids), Some(identity)) = (self.ids_mut(method), identity) {
                    ids.insert(identity.clone());
                }
            }
        }
        if method.is_save() {
            self.errors.remove(&method);
        }
    }

    /// Leave the pending state.
    pub fn settle(&mut self, method: Method, identity: Option<&Identity>) {
        match method {
            Method::Find => self.is_find_pending = false,
            Method::Get => self.is_get_pending = false,
            _ => {
                if let (Some(ids), Some(identity)) = (self.ids_mut(method), identity) {
                    ids.remove(identity);
                }
            }
        }
    }

    /// Record an error and leave the pending state.
    pub fn fail(&mut self, method: Method, identity: Option<&Identity>, error: TransportError) {
        self.errors.insert(method, error);
        self.settle(method, identity);
    }

    pub fn is_pending(&self, method: Method, identity: &Identity) -> bool {
        match method {
            Method::Find => self.is_find_pending,
            Method::Get => self.is_get_pending,
            _ => self.ids(method).is_some_and(|ids| ids.contains(identity)),
        }
    }

    /// Whether any operation of `method` is in flight.
    pub fn is_method_pending(&self, method: Method) -> bool {
        match method {
            Method::Find => self.is_find_pending,
            Method::Get => self.is_get_pending,
            _ => self.ids(method).is_some_and(|ids| !ids.is_empty()),
        }
    }

    pub fn is_find_pending(&self) -> bool {
        self.is_find_pending
    }

    pub fn is_get_pending(&self) -> bool {
        self.is_get_pending
    }

    /// Create, update or patch in flight for `identity`.
    pub fn is_save_pending(&self, identity: &Identity) -> bool {
        [Method::Create, Method::Update, Method::Patch]
            .into_iter()
            .any(|method| self.is_pending(method, identity))
    }

    /// Any save or remove in flight for `identity`.
    pub fn is_any_pending(&self, identity: &Identity) -> bool {
        self.is_save_pending(identity) || self.is_pending(Method::Remove, identity)
    }

    pub fn error(&self, method: Method) -> Option<&TransportError> {
        self.errors.get(&method)
    }

    pub fn clear_error(&mut self, method: Method) {
        self.errors.remove(&method);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
