//! Method and event kinds.
//!
//! [`Method`] names the transport calls whose pending and error state the
//! store tracks. [`EventKind`] names the push notifications the store ingests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A transport method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Find,
    Get,
    Create,
    Update,
    Patch,
    Remove,
}

impl Method {
    /// Methods tracked per record id.
    pub const MUTATIONS: [Method; 4] = [Method::Create, Method::Update, Method::Patch, Method::Remove];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Find => "find",
            Method::Get => "get",
            Method::Create => "create",
            Method::Update => "update",
            Method::Patch => "patch",
            Method::Remove => "remove",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Method::Find | Method::Get)
    }

    /// Create, update and patch: the methods that persist record data.
    pub fn is_save(&self) -> bool {
        matches!(self, Method::Create | Method::Update | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Patched,
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Patched => "patched",
            EventKind::Removed => "removed",
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, EventKind::Removed)
    }

    /// The method whose success produces this event remotely.
    pub fn method(&self) -> Method {
        match self {
            EventKind::Created => Method::Create,
            EventKind::Updated => Method::Update,
            EventKind::Patched => Method::Patch,
            EventKind::Removed => Method::Remove,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_classification() {
        assert!(!Method::Find.is_mutation());
        assert!(!Method::Get.is_mutation());
        assert!(Method::MUTATIONS.iter().all(Method::is_mutation));
        assert!(Method::Patch.is_save());
        assert!(!Method::Remove.is_save());
    }

    #[test]
    fn event_kind_maps_to_method() {
        assert_eq!(EventKind::Created.method(), Method::Create);
        assert_eq!(EventKind::Removed.method(), Method::Remove);
        assert!(EventKind::Removed.is_removal());
        assert!(!EventKind::Patched.is_removal());
    }

    #[test]
    fn serialization_format() {
        assert_eq!(serde_json::to_string(&Method::Patch).unwrap(), "\"patch\"");
        let kind: EventKind = serde_json::from_str("\"updated\"").unwrap();
        assert_eq!(kind, EventKind::Updated);
    }
}
