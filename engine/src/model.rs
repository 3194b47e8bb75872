//! Model descriptors.
//!
//! A [`Model`] is the immutable description of one entity type: its identity
//! fields, default values, a post-construction hook, and the accessors every
//! instance carries. It is handed to the store once at construction.

use crate::record::{Accessor, Fields, Record};
use crate::IdFields;
use std::fmt;
use std::sync::Arc;

/// Produces default field values for new instances.
pub type DefaultsFn = Arc<dyn Fn() -> Fields + Send + Sync>;
/// Runs on every newly constructed instance.
pub type SetupFn = Arc<dyn Fn(&mut Record) + Send + Sync>;

/// Description of an entity type.
#[derive(Clone)]
pub struct Model {
    name: Arc<str>,
    id_fields: IdFields,
    instance_defaults: Option<DefaultsFn>,
    setup_instance: Option<SetupFn>,
    accessors: Vec<Accessor>,
}

impl Model {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            id_fields: IdFields::default(),
            instance_defaults: None,
            setup_instance: None,
            accessors: Vec::new(),
        }
    }

    pub fn with_id_fields(mut self, id_fields: IdFields) -> Self {
        self.id_fields = id_fields;
        self
    }

    /// Default values; data supplied at construction is merged over them.
    pub fn with_defaults(mut self, defaults: impl Fn() -> Fields + Send + Sync + 'static) -> Self {
        self.instance_defaults = Some(Arc::new(defaults));
        self
    }

    pub fn with_setup(mut self, setup: impl Fn(&mut Record) + Send + Sync + 'static) -> Self {
        self.setup_instance = Some(Arc::new(setup));
        self
    }

    pub fn with_accessor(mut self, accessor: Accessor) -> Self {
        self.accessors.retain(|a| a.name() != accessor.name());
        self.accessors.push(accessor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_fields(&self) -> &IdFields {
        &self.id_fields
    }

    /// Whether `record` was constructed by this model.
    pub fn is_instance(&self, record: &Record) -> bool {
        record.model_name() == Some(self.name())
    }

    /// Construct an instance: accessors, then defaults, then data, then the
    /// setup hook. Defaults and data are assigned with [`Record::set`], so
    /// accessor fields go through their setters. The instance is not
    /// inserted anywhere.
    pub fn build(&self, fields: Fields) -> Record {
        let mut record = Record::default();
        for accessor in &self.accessors {
            record.define_accessor(accessor.clone());
        }

        if let Some(defaults) = &self.instance_defaults {
            for (name, value) in defaults() {
                record.set(name, value);
            }
        }
        for (name, value) in fields {
            record.set(name, value);
        }

        record.set_model(Arc::clone(&self.name));
        if let Some(setup) = &self.setup_instance {
            setup(&mut record);
        }
        record
    }

    /// Build `record` unless it already is an instance of this model.
    pub fn instantiate(&self, record: Record) -> Record {
        if self.is_instance(&record) {
            record
        } else {
            self.build(record.into_fields())
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("id_fields", &self.id_fields)
            .field("instance_defaults", &self.instance_defaults.is_some())
            .field("setup_instance", &self.setup_instance.is_some())
            .field("accessors", &self.accessors)
            .finish()
    }
}
