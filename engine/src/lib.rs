//! # Perch Engine
//!
//! A normalized entity cache with a query and mutation engine.
//!
//! This crate holds the synchronous core of perch: it stores fetched records
//! keyed by identity, tracks not-yet-persisted records separately, keeps at
//! most one working copy per record, answers filtered and paginated queries,
//! and coalesces push events. The async runtime lives in `perch-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about transports or tasks
//! - **No clocks**: time enters as explicit millisecond timestamps
//! - **Stable records**: stored records are merged in place, never replaced
//!
//! ## Core Concepts
//!
//! ### Records and identity
//!
//! A [`Record`] is a JSON object plus optional computed [`Accessor`]s. Its
//! [`Identity`] is either permanent (the `id` field by default) or temporary
//! (the `__id` field by default). Ids are keyed by their string form.
//!
//! ### Models
//!
//! A [`Model`] describes an entity type: id field names, instance defaults,
//! a setup hook, and accessors. Records entering the [`EntityTable`] are
//! built through the model.
//!
//! ### Copies
//!
//! [`CopyManager`] keeps one isolated working copy per record. A copy is
//! written back with commit or discarded with reset.
//!
//! ### Queries
//!
//! [`Query`] parses a filter object with `$sort`, `$limit`, `$skip`,
//! `$select` and a fixed operator set. [`Store::find_in_store`] memoizes
//! results per distinct [`Params`] until the next write.
//!
//! ## Quick Start
//!
//! ```rust
//! use perch_engine::{Model, Params, Record, Store, StoreConfig};
//! use serde_json::json;
//!
//! let mut store = Store::new(StoreConfig::new("todos", Model::new("Todo")));
//!
//! store.add_or_update(Record::from_value(json!({"id": 1, "done": false})).unwrap());
//! store.add_or_update(Record::from_value(json!({"id": 2, "done": true})).unwrap());
//!
//! let open = store
//!     .find_in_store(&Params::from_query(json!({"done": false})))
//!     .unwrap();
//! assert_eq!(open.total, 1);
//! ```
//!
//! ## Snapshots
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with
//! [`StoreSnapshot`] for hydration and inspection.

pub mod copies;
pub mod error;
pub mod events;
pub mod identity;
pub mod model;
pub mod operation;
pub mod pagination;
pub mod pending;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod table;

// Re-export main types at crate root
pub use copies::{CopyManager, CopyStorage};
pub use error::{Error, Result};
pub use events::{Debounce, EventQueue, Flush, DEFAULT_MAX_WAIT_MS};
pub use identity::{Id, IdFields, Identity, DEFAULT_ID_FIELD, DEFAULT_TEMP_ID_FIELD};
pub use model::Model;
pub use operation::{EventKind, Method};
pub use pagination::{PageInfo, Pagination, DEFAULT_QID};
pub use pending::{PendingTracker, TransportError};
pub use query::{CustomOperator, Params, Query, QueryOptions, QueryResult};
pub use reconcile::{ReconcileResult, Reconciler};
pub use record::{Accessor, Fields, Record};
pub use snapshot::{SnapshotCopy, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Store, StoreConfig};
pub use table::{EntityTable, Upserted};

/// Milliseconds on the caller's clock.
pub type Timestamp = u64;
