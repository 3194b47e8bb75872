//! An in-process transport.
//!
//! `MemoryTransport` keeps records in a map, answers finds with the engine's
//! query evaluator, and broadcasts an event for every successful mutation.
//! Failures and latency can be scripted per method for tests.

use crate::config::DEFAULT_PARAMS_FOR_SERVER;
use crate::transport::{FindResponse, RemoteEvent, Transport};
use perch_engine::{
    EventKind, Fields, Id, IdFields, Method, Params, Query, QueryOptions, Record, TransportError,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct MemoryState {
    order: Vec<Id>,
    records: HashMap<Id, Fields>,
    next_id: u64,
    failures: HashMap<Method, VecDeque<TransportError>>,
    delays: HashMap<Method, VecDeque<Duration>>,
    calls: Vec<Method>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> Id {
        loop {
            self.next_id += 1;
            let id = Id::from(self.next_id);
            if !self.records.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, id_fields: &IdFields, mut fields: Fields) -> Fields {
        let id = match id_fields.permanent_id(&fields) {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                fields.insert(id_fields.id_field.clone(), Value::from(self.next_id));
                id
            }
        };
        if self.records.insert(id.clone(), fields.clone()).is_none() {
            self.order.push(id);
        }
        fields
    }

    fn existing(&mut self, id: &Id) -> Result<&mut Fields, TransportError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| TransportError::not_found(format!("No record found for id '{id}'")))
    }
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<RemoteEvent>,
    id_fields: IdFields,
    query_options: QueryOptions,
    always_paginate: bool,
}

/// In-memory [`Transport`]. Clones share the same data.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("records", &self.state().records.len())
            .field("always_paginate", &self.inner.always_paginate)
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::build(IdFields::default(), QueryOptions::default(), false)
    }

    /// Respond to every find with a page, not only those with `$limit`.
    pub fn paginated() -> Self {
        Self::build(IdFields::default(), QueryOptions::default(), true)
    }

    /// Same transport with different id fields and query options.
    pub fn with_options(id_fields: IdFields, query_options: QueryOptions) -> Self {
        Self::build(id_fields, query_options, false)
    }

    /// Server-only keys such as `$populateParams` are always accepted and
    /// never matched.
    fn build(id_fields: IdFields, mut query_options: QueryOptions, always_paginate: bool) -> Self {
        for key in DEFAULT_PARAMS_FOR_SERVER {
            if !query_options.params_for_server.iter().any(|k| k == key) {
                query_options.params_for_server.push(key.to_string());
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                events,
                id_fields,
                query_options,
                always_paginate,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert records without emitting events. Objects only.
    pub fn seed(&self, records: impl IntoIterator<Item = Value>) {
        let mut state = self.state();
        for record in records {
            if let Value::Object(fields) = record {
                state.insert(&self.inner.id_fields, fields);
            }
        }
    }

    /// Make the next call of `method` fail with `error`.
    pub fn fail_next(&self, method: Method, error: TransportError) {
        self.state()
            .failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Make the next call of `method` take `delay` before answering.
    pub fn delay_next(&self, method: Method, delay: Duration) {
        self.state()
            .delays
            .entry(method)
            .or_default()
            .push_back(delay);
    }

    /// Broadcast an event as if another client had caused it.
    pub fn emit(&self, event: RemoteEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Methods called so far, in call order.
    pub fn calls(&self) -> Vec<Method> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, method: Method) -> usize {
        self.state().calls.iter().filter(|m| **m == method).count()
    }

    /// Stored records in insertion order.
    pub fn records(&self) -> Vec<Value> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|fields| Value::Object(fields.clone()))
            .collect()
    }

    pub fn record(&self, id: impl Into<Id>) -> Option<Value> {
        self.state()
            .records
            .get(&id.into())
            .map(|fields| Value::Object(fields.clone()))
    }

    async fn call<R, F>(&self, method: Method, op: F) -> Result<R, TransportError>
    where
        F: FnOnce(&mut MemoryState, &MemoryInner) -> Result<R, TransportError> + Send,
        R: Send,
    {
        let (delay, failure) = {
            let mut state = self.state();
            state.calls.push(method);
            let delay = state.delays.get_mut(&method).and_then(VecDeque::pop_front);
            let failure = state.failures.get_mut(&method).and_then(VecDeque::pop_front);
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut state = self.state();
        op(&mut *state, &*self.inner)
    }

    fn notify(&self, kind: EventKind, fields: &Fields) {
        self.emit(RemoteEvent::new(kind, Value::Object(fields.clone())));
    }
}

fn object(data: Value) -> Result<Fields, TransportError> {
    match data {
        Value::Object(fields) => Ok(fields),
        _ => Err(TransportError::new("BadRequest", "data must be an object").with_code(400)),
    }
}

impl Transport for MemoryTransport {
    async fn find(&self, params: &Params) -> Result<FindResponse, TransportError> {
        self.call(Method::Find, |state, inner| {
            let query = Query::parse(params.query.as_ref(), &inner.query_options)
                .map_err(|e| TransportError::new("BadRequest", e.to_string()).with_code(400))?;
            let candidates = state
                .order
                .iter()
                .filter_map(|id| state.records.get(id))
                .map(|fields| Record::new(fields.clone()))
                .collect();
            let result = query.execute(candidates, &inner.id_fields);
            let data = result.data.iter().map(Record::to_json).collect();

            if inner.always_paginate || query.limit().is_some() {
                Ok(FindResponse::Page {
                    total: result.total,
                    limit: result.limit,
                    skip: result.skip,
                    data,
                })
            } else {
                Ok(FindResponse::List(data))
            }
        })
        .await
    }

    async fn get(&self, id: &Id, _params: &Params) -> Result<Value, TransportError> {
        self.call(Method::Get, |state, _| {
            state.existing(id).map(|fields| Value::Object(fields.clone()))
        })
        .await
    }

    async fn create(&self, data: Value, _params: &Params) -> Result<Value, TransportError> {
        let created = self
            .call(Method::Create, |state, inner| {
                Ok(state.insert(&inner.id_fields, object(data)?))
            })
            .await?;
        self.notify(EventKind::Created, &created);
        Ok(Value::Object(created))
    }

    async fn update(&self, id: &Id, data: Value, _params: &Params) -> Result<Value, TransportError> {
        let updated = self
            .call(Method::Update, |state, inner| {
                let mut replacement = object(data)?;
                let existing = state.existing(id)?;
                if let Some(id_value) = existing.get(&inner.id_fields.id_field).cloned() {
                    replacement.insert(inner.id_fields.id_field.clone(), id_value);
                }
                *existing = replacement;
                Ok(existing.clone())
            })
            .await?;
        self.notify(EventKind::Updated, &updated);
        Ok(Value::Object(updated))
    }

    async fn patch(&self, id: &Id, data: Value, _params: &Params) -> Result<Value, TransportError> {
        let patched = self
            .call(Method::Patch, |state, _| {
                let changes = object(data)?;
                let existing = state.existing(id)?;
                for (name, value) in changes {
                    existing.insert(name, value);
                }
                Ok(existing.clone())
            })
            .await?;
        self.notify(EventKind::Patched, &patched);
        Ok(Value::Object(patched))
    }

    async fn remove(&self, id: &Id, _params: &Params) -> Result<Value, TransportError> {
        let removed = self
            .call(Method::Remove, |state, _| {
                let removed = state.records.remove(id).ok_or_else(|| {
                    TransportError::not_found(format!("No record found for id '{id}'"))
                })?;
                state.order.retain(|existing| existing != id);
                Ok(removed)
            })
            .await?;
        self.notify(EventKind::Removed, &removed);
        Ok(Value::Object(removed))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<RemoteEvent>> {
        Some(self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_ids_and_emits() {
        let transport = MemoryTransport::new();
        let mut events = transport.subscribe().unwrap();

        let created = transport
            .create(json!({"title": "a"}), &Params::new())
            .await
            .unwrap();
        assert_eq!(created, json!({"title": "a", "id": 1}));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.record, created);
    }

    #[tokio::test]
    async fn find_accepts_server_only_keys() {
        let transport = MemoryTransport::new();
        transport.seed([json!({"id": 1, "done": true}), json!({"id": 2, "done": false})]);

        let list = transport
            .find(&Params::from_query(
                json!({"done": true, "$populateParams": {"with": "owner"}}),
            ))
            .await
            .unwrap();
        assert_eq!(list.data(), &[json!({"id": 1, "done": true})]);
    }

    #[tokio::test]
    async fn find_filters_and_paginates() {
        let transport = MemoryTransport::new();
        transport.seed((1..=5).map(|i| json!({"id": i, "even": i % 2 == 0})));

        let list = transport
            .find(&Params::from_query(json!({"even": false})))
            .await
            .unwrap();
        let ids: Vec<_> = list.data().iter().map(|r| r["id"].clone()).collect();
        assert!(!list.is_paginated());
        assert_eq!(ids, vec![json!(1), json!(3), json!(5)]);

        let page = transport
            .find(&Params::from_query(json!({"$limit": 2, "$skip": 1})))
            .await
            .unwrap();
        assert!(page.is_paginated());
        assert_eq!(page.total(), 5);
        assert_eq!(
            page.data(),
            &[json!({"id": 2, "even": true}), json!({"id": 3, "even": false})]
        );
    }

    #[tokio::test]
    async fn scripted_failure_applies_once() {
        let transport = MemoryTransport::new();
        transport.seed([json!({"id": 1})]);
        transport.fail_next(Method::Get, TransportError::general("down"));

        let err = transport.get(&Id::from(1), &Params::new()).await.unwrap_err();
        assert_eq!(err.message, "down");
        assert!(transport.get(&Id::from(1), &Params::new()).await.is_ok());
        assert_eq!(transport.call_count(Method::Get), 2);
    }

    #[tokio::test]
    async fn update_replaces_and_patch_merges() {
        let transport = MemoryTransport::new();
        transport.seed([json!({"id": 1, "a": 1, "b": 2})]);

        let patched = transport
            .patch(&Id::from(1), json!({"b": 3}), &Params::new())
            .await
            .unwrap();
        assert_eq!(patched, json!({"id": 1, "a": 1, "b": 3}));

        let updated = transport
            .update(&Id::from(1), json!({"c": 4}), &Params::new())
            .await
            .unwrap();
        assert_eq!(updated, json!({"c": 4, "id": 1}));
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let transport = MemoryTransport::new();
        let err = transport.remove(&Id::from(9), &Params::new()).await.unwrap_err();
        assert_eq!(err.code, Some(404));
    }
}
