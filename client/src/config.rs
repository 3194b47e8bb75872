//! Configuration management for services.

use perch_engine::{CopyStorage, Debounce, IdFields, QueryOptions};
use serde::{Deserialize, Serialize};
use std::env;

/// Query keys forwarded to the server but never matched locally.
pub const DEFAULT_PARAMS_FOR_SERVER: &[&str] = &["$populateParams"];

/// Per-service options.
///
/// Deserializes from camelCase keys; every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOptions {
    /// Permanent id field
    pub id_field: String,
    /// Temporary id field
    pub temp_id_field: String,
    /// Save existing records with `update` instead of `patch`
    pub prefer_update: bool,
    /// Export copies with the store's state
    pub keep_copies_in_store: bool,
    /// Debounce window for push events, in milliseconds. `None` or `0`
    /// applies every event as it arrives.
    pub debounce_events_time: Option<u64>,
    /// Upper bound on how long a debounced batch may wait, in milliseconds
    pub debounce_events_max_wait: u64,
    /// Extra query operators allowed in local queries
    pub whitelist: Vec<String>,
    /// Query keys sent to the server but ignored locally
    pub params_for_server: Vec<String>,
    /// Remove local records missing from complete find responses
    pub auto_remove: bool,
    /// Default decision for push events
    pub enable_events: bool,
    /// Server alias under which the service registers
    pub server_alias: String,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            id_field: perch_engine::DEFAULT_ID_FIELD.to_string(),
            temp_id_field: perch_engine::DEFAULT_TEMP_ID_FIELD.to_string(),
            prefer_update: false,
            keep_copies_in_store: false,
            debounce_events_time: None,
            debounce_events_max_wait: perch_engine::DEFAULT_MAX_WAIT_MS,
            whitelist: Vec::new(),
            params_for_server: DEFAULT_PARAMS_FOR_SERVER
                .iter()
                .map(|key| key.to_string())
                .collect(),
            auto_remove: false,
            enable_events: true,
            server_alias: "api".to_string(),
        }
    }
}

impl ServiceOptions {
    /// Load options from `PERCH_*` environment variables, reading a `.env`
    /// file first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load options from any key lookup. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        if let Some(value) = lookup("PERCH_ID_FIELD") {
            options.id_field = value;
        }
        if let Some(value) = lookup("PERCH_TEMP_ID_FIELD") {
            options.temp_id_field = value;
        }
        if let Some(value) = lookup("PERCH_PREFER_UPDATE") {
            options.prefer_update = parse_bool("PERCH_PREFER_UPDATE", &value)?;
        }
        if let Some(value) = lookup("PERCH_KEEP_COPIES_IN_STORE") {
            options.keep_copies_in_store = parse_bool("PERCH_KEEP_COPIES_IN_STORE", &value)?;
        }
        if let Some(value) = lookup("PERCH_DEBOUNCE_EVENTS_TIME") {
            options.debounce_events_time = Some(parse_ms("PERCH_DEBOUNCE_EVENTS_TIME", &value)?);
        }
        if let Some(value) = lookup("PERCH_DEBOUNCE_EVENTS_MAX_WAIT") {
            options.debounce_events_max_wait = parse_ms("PERCH_DEBOUNCE_EVENTS_MAX_WAIT", &value)?;
        }
        if let Some(value) = lookup("PERCH_WHITELIST") {
            options.whitelist = parse_list(&value);
        }
        if let Some(value) = lookup("PERCH_PARAMS_FOR_SERVER") {
            options.params_for_server = parse_list(&value);
        }
        if let Some(value) = lookup("PERCH_AUTO_REMOVE") {
            options.auto_remove = parse_bool("PERCH_AUTO_REMOVE", &value)?;
        }
        if let Some(value) = lookup("PERCH_ENABLE_EVENTS") {
            options.enable_events = parse_bool("PERCH_ENABLE_EVENTS", &value)?;
        }
        if let Some(value) = lookup("PERCH_SERVER_ALIAS") {
            options.server_alias = value;
        }

        options.validate()?;
        Ok(options)
    }

    /// Check the options are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_field.is_empty() {
            return Err(ConfigError::EmptyField("idField"));
        }
        if self.temp_id_field.is_empty() {
            return Err(ConfigError::EmptyField("tempIdField"));
        }
        if self.server_alias.is_empty() {
            return Err(ConfigError::EmptyField("serverAlias"));
        }
        if self.id_field == self.temp_id_field {
            return Err(ConfigError::InvalidValue {
                name: "tempIdField",
                reason: "must differ from idField".into(),
            });
        }
        // Both are always read as permanent ids
        if matches!(self.temp_id_field.as_str(), "id" | "_id") {
            return Err(ConfigError::InvalidValue {
                name: "tempIdField",
                reason: format!("'{}' is reserved for permanent ids", self.temp_id_field),
            });
        }
        if let Some(op) = self.whitelist.iter().find(|op| !op.starts_with('$')) {
            return Err(ConfigError::InvalidValue {
                name: "whitelist",
                reason: format!("'{op}' is not an operator"),
            });
        }
        Ok(())
    }

    pub fn id_fields(&self) -> IdFields {
        IdFields::new(self.id_field.clone(), self.temp_id_field.clone())
    }

    pub fn debounce(&self) -> Option<Debounce> {
        self.debounce_events_time
            .filter(|wait| *wait > 0)
            .map(|wait| Debounce::new(wait).with_max_wait(self.debounce_events_max_wait))
    }

    pub fn copy_storage(&self) -> CopyStorage {
        if self.keep_copies_in_store {
            CopyStorage::InStore
        } else {
            CopyStorage::Side
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            whitelist: self.whitelist.clone(),
            params_for_server: self.params_for_server.clone(),
            ..QueryOptions::default()
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn parse_ms(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        reason: format!("'{value}' is not a number of milliseconds"),
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("a transport is required")]
    MissingTransport,

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("service '{name}' is already registered under '{alias}'")]
    DuplicateModel { alias: String, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let options = ServiceOptions::default();
        assert_eq!(options.id_field, "id");
        assert_eq!(options.temp_id_field, "__id");
        assert!(options.enable_events);
        assert_eq!(options.debounce_events_max_wait, 1000);
        assert_eq!(options.params_for_server, vec!["$populateParams"]);
        assert!(options.debounce().is_none());
        assert_eq!(options.copy_storage(), CopyStorage::Side);
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let options: ServiceOptions = serde_json::from_value(serde_json::json!({
            "idField": "_id",
            "debounceEventsTime": 50,
            "keepCopiesInStore": true
        }))
        .unwrap();
        assert_eq!(options.id_field, "_id");
        assert_eq!(options.debounce(), Some(Debounce::new(50)));
        assert_eq!(options.copy_storage(), CopyStorage::InStore);
        assert_eq!(options.server_alias, "api");
    }

    #[test]
    fn zero_debounce_window_disables_debouncing() {
        let options = ServiceOptions {
            debounce_events_time: Some(0),
            ..ServiceOptions::default()
        };
        assert!(options.debounce().is_none());
    }

    #[test]
    fn reads_lookup() {
        let options = ServiceOptions::from_lookup(lookup(&[
            ("PERCH_PREFER_UPDATE", "true"),
            ("PERCH_DEBOUNCE_EVENTS_TIME", "25"),
            ("PERCH_WHITELIST", "$regex, $exists"),
            ("PERCH_SERVER_ALIAS", "chat"),
        ]))
        .unwrap();
        assert!(options.prefer_update);
        assert_eq!(options.debounce_events_time, Some(25));
        assert_eq!(options.whitelist, vec!["$regex", "$exists"]);
        assert_eq!(options.server_alias, "chat");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ServiceOptions::from_lookup(lookup(&[("PERCH_AUTO_REMOVE", "maybe")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            ServiceOptions::from_lookup(lookup(&[("PERCH_ID_FIELD", "")])),
            Err(ConfigError::EmptyField("idField"))
        );
        assert!(matches!(
            ServiceOptions::from_lookup(lookup(&[("PERCH_TEMP_ID_FIELD", "id")])),
            Err(ConfigError::InvalidValue { name: "tempIdField", .. })
        ));
        assert!(matches!(
            ServiceOptions::from_lookup(lookup(&[
                ("PERCH_ID_FIELD", "key"),
                ("PERCH_TEMP_ID_FIELD", "_id"),
            ])),
            Err(ConfigError::InvalidValue { name: "tempIdField", .. })
        ));
        assert!(matches!(
            ServiceOptions::from_lookup(lookup(&[("PERCH_WHITELIST", "regex")])),
            Err(ConfigError::InvalidValue { name: "whitelist", .. })
        ));
    }
}
