//! # Perch Client
//!
//! Async services over the perch engine.
//!
//! A [`Service`] pairs one resource's [`Store`](perch_engine::Store) with a
//! [`Transport`]. It runs remote finds and mutations, tracks their pending
//! state and errors, merges responses into the cache, and ingests push
//! events with optional debouncing.
//!
//! ## Quick Start
//!
//! ```rust
//! use perch_client::{MemoryTransport, ServiceBuilder};
//! use perch_engine::{Model, Params};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> perch_client::Result<()> {
//! let todos = ServiceBuilder::new(Model::new("Todo"))
//!     .transport(MemoryTransport::new())
//!     .build()?;
//!
//! let created = todos.create(json!({"title": "write docs"}), &Params::new()).await?;
//! assert_eq!(created.field("id"), Some(&json!(1)));
//!
//! let cached = todos.find_in_store(&Params::new())?;
//! assert_eq!(cached.total, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Push events
//!
//! [`Service::handle_event`] applies one event; [`Service::listen`] spawns a
//! task that feeds the transport's subscription into the service. Applied
//! changes are announced through the service's [`Notifier`].

pub mod config;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod notifier;
pub mod registry;
pub mod service;
pub mod transport;

pub use config::{ConfigError, ServiceOptions, DEFAULT_PARAMS_FOR_SERVER};
pub use error::{Error, Result};
pub use ingest::{Decision, EventHandlers, Listener};
pub use memory::MemoryTransport;
pub use notifier::{Emits, ModelEvent, Notifier};
pub use registry::Registry;
pub use service::{Service, ServiceBuilder};
pub use transport::{FindResponse, RemoteEvent, Transport};
