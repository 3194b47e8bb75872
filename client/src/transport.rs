//! The transport seam.
//!
//! A [`Transport`] performs the remote calls of one resource and, when it
//! supports push notifications, hands out a broadcast subscription of
//! [`RemoteEvent`]s. Errors are returned verbatim as [`TransportError`].

use perch_engine::{EventKind, Id, Params, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tokio::sync::broadcast;

/// A find response: a page with totals, or a plain list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FindResponse {
    Page {
        total: usize,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        skip: usize,
        data: Vec<Value>,
    },
    List(Vec<Value>),
}

impl FindResponse {
    pub fn is_paginated(&self) -> bool {
        matches!(self, FindResponse::Page { .. })
    }

    /// Reported total, or the list length.
    pub fn total(&self) -> usize {
        match self {
            FindResponse::Page { total, .. } => *total,
            FindResponse::List(data) => data.len(),
        }
    }

    pub fn data(&self) -> &[Value] {
        match self {
            FindResponse::Page { data, .. } | FindResponse::List(data) => data,
        }
    }

    pub fn into_data(self) -> Vec<Value> {
        match self {
            FindResponse::Page { data, .. } | FindResponse::List(data) => data,
        }
    }
}

/// A push notification from the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    pub kind: EventKind,
    pub record: Value,
}

impl RemoteEvent {
    pub fn new(kind: EventKind, record: Value) -> Self {
        Self { kind, record }
    }
}

/// Remote calls of one resource.
///
/// Params arrive with local-only flags already stripped.
pub trait Transport: Send + Sync + 'static {
    fn find(
        &self,
        params: &Params,
    ) -> impl Future<Output = Result<FindResponse, TransportError>> + Send;

    fn get(
        &self,
        id: &Id,
        params: &Params,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    fn create(
        &self,
        data: Value,
        params: &Params,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    fn update(
        &self,
        id: &Id,
        data: Value,
        params: &Params,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    fn patch(
        &self,
        id: &Id,
        data: Value,
        params: &Params,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    fn remove(
        &self,
        id: &Id,
        params: &Params,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Subscribe to push events. `None` when the transport has none.
    fn subscribe(&self) -> Option<broadcast::Receiver<RemoteEvent>> {
        None
    }
}
