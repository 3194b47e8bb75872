//! Shared helpers for client integration tests.

#![allow(dead_code)]

use perch_client::{MemoryTransport, Service, ServiceBuilder, ServiceOptions};
use perch_engine::{Id, Model, Params, Record};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("perch_client=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn todos(transport: &MemoryTransport) -> Service<MemoryTransport> {
    todos_with(transport, ServiceOptions::default())
}

pub fn todos_with(transport: &MemoryTransport, options: ServiceOptions) -> Service<MemoryTransport> {
    init_tracing();
    ServiceBuilder::new(Model::new("Todo"))
        .options(options)
        .transport(transport.clone())
        .build()
        .unwrap()
}

/// A cached record's field, read through the local store.
pub fn cached(service: &Service<MemoryTransport>, id: impl Into<Id>, field: &str) -> Option<Value> {
    service
        .get_from_store(id, &Params::new())
        .unwrap()
        .and_then(|record: Record| record.field(field).cloned())
}
