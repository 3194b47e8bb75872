//! Service - the mutation coordinator and query surface of one resource.
//!
//! A `Service` owns a [`Store`] behind a mutex and a [`Transport`]. Remote
//! calls run outside the lock; every cache change is one short critical
//! section before or after a call, so changes never interleave partially.
//!
//! # Mutation lifecycle
//!
//! 1. Enter pending for the method and identity (saves clear the last error)
//! 2. Call the transport with local-only params stripped
//! 3. Success: merge the response and leave pending
//! 4. Failure: record the error, leave pending and return the error
//!
//! Concurrent mutations of the same id are not serialized. The last
//! response merged wins, and the first one to settle clears the pending flag.

use crate::config::{ConfigError, ServiceOptions};
use crate::error::Result;
use crate::ingest::{Decision, EventHandlers, Listener};
use crate::notifier::{Emits, ModelEvent, Notifier};
use crate::transport::{FindResponse, Transport};
use perch_engine::{
    CustomOperator, EventKind, Fields, Id, Identity, Method, Model, Params, PendingTracker,
    QueryResult, ReconcileResult, Record, Store, StoreConfig, StoreSnapshot, Timestamp,
    TransportError,
};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Builds a [`Service`].
pub struct ServiceBuilder<T> {
    model: Model,
    options: ServiceOptions,
    transport: Option<T>,
    handlers: EventHandlers,
    operators: Vec<(String, CustomOperator)>,
    notifier: Option<Notifier>,
}

impl<T: Transport> ServiceBuilder<T> {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            options: ServiceOptions::default(),
            transport: None,
            handlers: EventHandlers::default(),
            operators: Vec::new(),
            notifier: None,
        }
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace all event decision handlers.
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the decision handler of one event kind.
    pub fn on_event<D>(
        mut self,
        kind: EventKind,
        handler: impl Fn(&Record, &Store) -> D + Send + Sync + 'static,
    ) -> Self
    where
        D: Into<Decision>,
    {
        self.handlers = self.handlers.on(kind, handler);
        self
    }

    /// Register and whitelist a custom query operator.
    pub fn operator(mut self, name: impl Into<String>, operator: CustomOperator) -> Self {
        self.operators.push((name.into(), operator));
        self
    }

    /// Announce applied events through an existing notifier.
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the options and construct the service.
    ///
    /// The options' id fields replace the model's.
    pub fn build(self) -> Result<Service<T>> {
        self.options.validate()?;
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;

        let model = self.model.with_id_fields(self.options.id_fields());
        let name = model.name().to_string();

        let mut query_options = self.options.query_options();
        for (op, operator) in self.operators {
            query_options = query_options.with_operator(op, operator);
        }

        let config = StoreConfig::new(name.clone(), model)
            .copy_storage(self.options.copy_storage())
            .query_options(query_options)
            .debounce(self.options.debounce())
            .auto_remove(self.options.auto_remove);

        tracing::debug!(
            service = %name,
            alias = %self.options.server_alias,
            debounce = ?self.options.debounce_events_time,
            "Service created"
        );

        Ok(Service {
            inner: Arc::new(Inner {
                name,
                options: self.options,
                transport,
                store: Mutex::new(Store::new(config)),
                handlers: self.handlers,
                notifier: self.notifier.unwrap_or_default(),
                wake: Notify::new(),
                started: Instant::now(),
            }),
        })
    }
}

struct Inner<T> {
    name: String,
    options: ServiceOptions,
    transport: T,
    store: Mutex<Store>,
    handlers: EventHandlers,
    notifier: Notifier,
    wake: Notify,
    /// Origin of the event queue's millisecond clock
    started: Instant,
}

/// One resource's cache plus its remote operations. Clones share state.
pub struct Service<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

impl<T: Transport> Service<T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with read access to the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store())
    }

    fn now_ms(&self) -> Timestamp {
        u64::try_from(self.inner.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    // ========================================================================
    // Remote queries
    // ========================================================================

    /// Fetch from the transport and merge the response.
    ///
    /// Paginated responses record pagination state under the params' qid.
    /// With `auto_remove`, a plain list also drops permanent records missing
    /// from it.
    pub async fn find(&self, params: &Params) -> Result<FindResponse> {
        self.store().begin(Method::Find, None);

        let response = match self.inner.transport.find(&params.for_server()).await {
            Ok(response) => response,
            Err(e) => return Err(self.failed(Method::Find, None, e)),
        };

        let records = match to_records(response.data()) {
            Ok(records) => records,
            Err(e) => {
                self.store().settle(Method::Find, None);
                return Err(e.into());
            }
        };

        {
            let mut store = self.store();
            let ids: Vec<Id> = records
                .iter()
                .filter_map(|record| store.id_fields().permanent_id(record.fields()))
                .collect();
            let result = store.add_or_update_all(records, response.is_paginated());

            if let FindResponse::Page {
                total, limit, skip, ..
            } = &response
            {
                store.update_pagination(params, ids, *total, *limit, *skip, wall_clock_ms());
            }
            store.settle(Method::Find, None);

            tracing::debug!(
                service = %self.name(),
                method = %Method::Find,
                added = result.added.len(),
                updated = result.updated.len(),
                removed = result.removed.len(),
                "Find settled"
            );
        }

        Ok(response)
    }

    /// Fetch one record and merge it.
    pub async fn get(&self, id: impl Into<Id>, params: &Params) -> Result<Record> {
        let id = id.into();
        self.store().begin(Method::Get, None);

        let response = match self.inner.transport.get(&id, &params.for_server()).await {
            Ok(response) => response,
            Err(e) => return Err(self.failed(Method::Get, None, e)),
        };

        let mut store = self.store();
        store.settle(Method::Get, None);
        let record = Record::from_value(response)?;
        let identity = store.add_or_update(record);

        tracing::debug!(service = %self.name(), method = %Method::Get, id = %identity, "Get settled");
        stored(&store, &identity)
    }

    /// Remote count of records matching the params' query.
    ///
    /// Issues a find with `$limit: 0` and returns its total. The cache is
    /// left untouched.
    pub async fn count(&self, params: &Params) -> Result<usize> {
        if params.query.is_none() {
            return Err(perch_engine::Error::InvalidArgument(
                "params must contain a query object".into(),
            )
            .into());
        }
        let server = params.for_server().with_query_key("$limit", Value::from(0));

        self.store().begin(Method::Find, None);
        match self.inner.transport.find(&server).await {
            Ok(response) => {
                self.store().settle(Method::Find, None);
                Ok(response.total())
            }
            Err(e) => Err(self.failed(Method::Find, None, e)),
        }
    }

    // ========================================================================
    // Local queries
    // ========================================================================

    pub fn find_in_store(&self, params: &Params) -> Result<QueryResult> {
        Ok(self.store().find_in_store(params)?)
    }

    pub fn get_from_store(&self, id: impl Into<Id>, params: &Params) -> Result<Option<Record>> {
        Ok(self.store().get_from_store(&id.into(), params)?)
    }

    pub fn count_in_store(&self, params: &Params) -> Result<usize> {
        Ok(self.store().count_in_store(params)?)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create a record remotely.
    ///
    /// Records without a permanent id are staged as temps first and promoted
    /// in place when the transport answers. The temp id field is never sent.
    pub async fn create(&self, data: Value, params: &Params) -> Result<Record> {
        let record = Record::from_value(data)?;

        let (identity, payload) = {
            let mut store = self.store();
            let id_fields = store.id_fields().clone();
            let identity = match id_fields.permanent_id(record.fields()) {
                Some(id) => Identity::Permanent(id),
                None => store.add_temp(record.clone()),
            };
            store.begin(Method::Create, Some(&identity));

            let mut payload = record.into_fields();
            payload.shift_remove(&id_fields.temp_id_field);
            (identity, payload)
        };

        let response = self
            .inner
            .transport
            .create(Value::Object(payload), &params.for_server())
            .await;
        let created = match response {
            Ok(created) => created,
            Err(e) => return Err(self.failed(Method::Create, Some(&identity), e)),
        };

        let mut store = self.store();
        store.settle(Method::Create, Some(&identity));
        let created = Record::from_value(created)?;
        let result = match &identity {
            Identity::Temporary(temp) => store.promote_temp(temp, created),
            Identity::Permanent(_) => store.add_or_update(created),
        };

        tracing::debug!(
            service = %self.name(),
            method = %Method::Create,
            id = %result,
            staged = %identity,
            "Create settled"
        );
        stored(&store, &result)
    }

    /// Replace a record remotely.
    pub async fn update(&self, id: impl Into<Id>, data: Value, params: &Params) -> Result<Record> {
        self.save_existing(Method::Update, id.into(), data, params)
            .await
    }

    /// Merge changes into a record remotely.
    pub async fn patch(&self, id: impl Into<Id>, data: Value, params: &Params) -> Result<Record> {
        self.save_existing(Method::Patch, id.into(), data, params)
            .await
    }

    async fn save_existing(
        &self,
        method: Method,
        id: Id,
        data: Value,
        params: &Params,
    ) -> Result<Record> {
        let identity = Identity::Permanent(id.clone());
        {
            let mut store = self.store();
            if let Some(Identity::Temporary(_)) = store.identity_of(&id) {
                return Err(perch_engine::Error::InvalidOperation(format!(
                    "cannot {method} '{id}': the record has not been created"
                ))
                .into());
            }
            store.begin(method, Some(&identity));
        }

        let server = params.for_server();
        let response = match method {
            Method::Update => self.inner.transport.update(&id, data, &server).await,
            _ => self.inner.transport.patch(&id, data, &server).await,
        };
        let saved = match response {
            Ok(saved) => saved,
            Err(e) => return Err(self.failed(method, Some(&identity), e)),
        };

        let mut store = self.store();
        store.settle(method, Some(&identity));
        let saved = store.add_or_update(Record::from_value(saved)?);

        tracing::debug!(service = %self.name(), method = %method, id = %saved, "Save settled");
        stored(&store, &saved)
    }

    /// Remove a record remotely.
    ///
    /// Temp-only records are removed locally without a remote call. With
    /// `eager` the local removal happens before the call and is not undone
    /// if the call fails. Returns the removed record when one is known.
    pub async fn remove(&self, id: impl Into<Id>, params: &Params) -> Result<Option<Record>> {
        let id = id.into();
        let identity = Identity::Permanent(id.clone());
        {
            let mut store = self.store();
            if let Some(Identity::Temporary(_)) = store.identity_of(&id) {
                let record = store.get(&id).cloned();
                store.remove(&id);
                tracing::debug!(service = %self.name(), method = %Method::Remove, id = %id, "Removed temp record locally");
                return Ok(record);
            }
            if params.eager {
                store.remove(&id);
            }
            store.begin(Method::Remove, Some(&identity));
        }

        let removed = match self.inner.transport.remove(&id, &params.for_server()).await {
            Ok(removed) => removed,
            Err(e) => return Err(self.failed(Method::Remove, Some(&identity), e)),
        };

        let mut store = self.store();
        store.remove(&id);
        store.settle(Method::Remove, Some(&identity));

        tracing::debug!(service = %self.name(), method = %Method::Remove, id = %id, "Remove settled");
        match removed {
            Value::Object(fields) => Ok(Some(store.instantiate(Record::new(fields)))),
            _ => Ok(None),
        }
    }

    /// Remove a record by its own identity.
    pub async fn remove_record(&self, record: &Record, params: &Params) -> Result<Option<Record>> {
        let identity = self.store().id_fields().identify(record.fields());
        match identity {
            Some(identity) => self.remove(identity.id().clone(), params).await,
            None => Err(perch_engine::Error::InvalidArgument("record has no id".into()).into()),
        }
    }

    /// Create records without a permanent id; update or patch the rest.
    pub async fn save(&self, record: &Record, params: &Params) -> Result<Record> {
        let id = self.store().id_fields().permanent_id(record.fields());
        let data = record.to_json();
        match id {
            None => self.create(data, params).await,
            Some(id) if self.inner.options.prefer_update => self.update(id, data, params).await,
            Some(id) => self.patch(id, data, params).await,
        }
    }

    fn failed(&self, method: Method, identity: Option<&Identity>, error: TransportError) -> crate::Error {
        tracing::warn!(
            service = %self.name(),
            method = %method,
            id = ?identity.map(ToString::to_string),
            "Transport call failed: {}",
            error
        );
        self.store().fail(method, identity, error.clone());
        error.into()
    }

    // ========================================================================
    // Local records and copies
    // ========================================================================

    /// Build a model instance and add it to the cache.
    ///
    /// Records without a permanent id land in the temp partition.
    pub fn instantiate(&self, data: Value) -> Result<Record> {
        let record = Record::from_value(data)?;
        let mut store = self.store();
        let identity = match store.id_fields().permanent_id(record.fields()) {
            Some(_) => store.add_or_update(record),
            None => store.add_temp(record),
        };
        stored(&store, &identity)
    }

    /// The working copy of a stored record, created on first use.
    pub fn clone_record(&self, id: impl Into<Id>, overrides: Option<Value>) -> Result<Record> {
        let overrides = overrides_from(overrides)?;
        let mut store = self.store();
        let identity = resolve(&store, &id.into())?;
        Ok(store.clone_record(&identity, overrides.as_ref())?)
    }

    /// The working copy of `record`. Fails for a record that is itself a copy.
    pub fn clone_of(&self, record: &Record, overrides: Option<Value>) -> Result<Record> {
        let overrides = overrides_from(overrides)?;
        Ok(self.store().clone_of_record(record, overrides.as_ref())?)
    }

    /// [`Service::reset`] for a copy value.
    pub fn reset_copy(&self, copy: &Record) -> Result<Record> {
        Ok(self.store().reset_copy(copy)?)
    }

    /// Write an edited copy value into its source.
    pub fn commit_copy(&self, copy: &Record) -> Result<Record> {
        let committed = self.store().commit_copy(copy)?;
        tracing::debug!(service = %self.name(), "Copy committed");
        Ok(committed)
    }

    /// Store an edited copy as the registered copy of its record.
    pub fn update_copy(&self, copy: &Record) -> Result<Record> {
        let mut store = self.store();
        let identity = store
            .id_fields()
            .identify(copy.fields())
            .ok_or_else(|| perch_engine::Error::InvalidArgument("copy has no id".into()))?;
        let identity = store.identity_of(identity.id()).unwrap_or(identity);
        Ok(store.put_copy(&identity, copy)?)
    }

    /// Discard edits by re-cloning the source.
    pub fn reset(&self, id: impl Into<Id>) -> Result<Record> {
        let mut store = self.store();
        let identity = resolve(&store, &id.into())?;
        Ok(store.reset(&identity)?)
    }

    /// Write the copy into its source and drop the copy.
    pub fn commit(&self, id: impl Into<Id>) -> Result<Record> {
        let mut store = self.store();
        let identity = resolve(&store, &id.into())?;
        let committed = store.commit(&identity)?;
        tracing::debug!(service = %self.name(), id = %identity, "Copy committed");
        Ok(committed)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Whether `method` is in flight for `id`, under either identity.
    pub fn is_pending(&self, method: Method, id: impl Into<Id>) -> bool {
        self.pending_for(&id.into(), |pending, identity| {
            pending.is_pending(method, identity)
        })
    }

    pub fn is_create_pending(&self, id: impl Into<Id>) -> bool {
        self.is_pending(Method::Create, id)
    }

    pub fn is_update_pending(&self, id: impl Into<Id>) -> bool {
        self.is_pending(Method::Update, id)
    }

    pub fn is_patch_pending(&self, id: impl Into<Id>) -> bool {
        self.is_pending(Method::Patch, id)
    }

    pub fn is_remove_pending(&self, id: impl Into<Id>) -> bool {
        self.is_pending(Method::Remove, id)
    }

    /// Create, update or patch in flight for `id`.
    pub fn is_save_pending(&self, id: impl Into<Id>) -> bool {
        self.pending_for(&id.into(), PendingTracker::is_save_pending)
    }

    /// Any mutation in flight for `id`.
    pub fn is_any_pending(&self, id: impl Into<Id>) -> bool {
        self.pending_for(&id.into(), PendingTracker::is_any_pending)
    }

    pub fn is_find_pending(&self) -> bool {
        self.store().pending().is_find_pending()
    }

    pub fn is_get_pending(&self) -> bool {
        self.store().pending().is_get_pending()
    }

    /// Whether any call of `method` is in flight.
    pub fn is_method_pending(&self, method: Method) -> bool {
        self.store().pending().is_method_pending(method)
    }

    fn pending_for(&self, id: &Id, check: impl Fn(&PendingTracker, &Identity) -> bool) -> bool {
        let store = self.store();
        [Identity::Permanent(id.clone()), Identity::Temporary(id.clone())]
            .iter()
            .any(|identity| check(store.pending(), identity))
    }

    /// Last error of `method`.
    pub fn error(&self, method: Method) -> Option<TransportError> {
        self.store().pending().error(method).cloned()
    }

    pub fn clear_error(&self, method: Method) {
        self.store().clear_error(method);
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Ingest one push event.
    ///
    /// Returns what changed when the event was applied right away, or `None`
    /// when it was ignored or queued for a debounced flush.
    pub fn handle_event(&self, kind: EventKind, data: Value) -> Result<Option<ReconcileResult>> {
        let record = Record::from_value(data)?;
        let now = self.now_ms();

        let (result, changes) = {
            let mut store = self.store();
            let decision = self.inner.handlers.decide(
                kind,
                &record,
                &store,
                self.inner.options.enable_events,
            );
            let record = match decision {
                Decision::Ignore => {
                    tracing::trace!(service = %self.name(), kind = %kind, "Event ignored");
                    return Ok(None);
                }
                Decision::Apply => record,
                Decision::Replace(replacement) => replacement,
            };

            match store.enqueue_event(kind, record, now) {
                Some(result) => {
                    let changes = changes(&store, &result);
                    (Some(result), changes)
                }
                None => (None, Vec::new()),
            }
        };

        if result.is_none() {
            self.inner.wake.notify_one();
        }
        self.announce(changes);
        Ok(result)
    }

    /// Apply all queued events now.
    pub fn flush_events(&self) -> Option<ReconcileResult> {
        let (result, changes) = {
            let mut store = self.store();
            let result = store.flush_events()?;
            let changes = changes(&store, &result);
            (result, changes)
        };
        tracing::debug!(service = %self.name(), changes = changes.len(), "Events flushed");
        self.announce(changes);
        Some(result)
    }

    pub(crate) fn flush_due(&self) -> Option<ReconcileResult> {
        let now = self.now_ms();
        let (result, changes) = {
            let mut store = self.store();
            let result = store.flush_due(now)?;
            let changes = changes(&store, &result);
            (result, changes)
        };
        tracing::debug!(service = %self.name(), changes = changes.len(), "Debounced events flushed");
        self.announce(changes);
        Some(result)
    }

    /// Number of events waiting for a debounced flush.
    pub fn queued_events(&self) -> usize {
        self.store().queued_events()
    }

    pub(crate) fn next_event_deadline(&self) -> Option<Instant> {
        let deadline = self.store().next_event_deadline()?;
        Some(self.inner.started + Duration::from_millis(deadline))
    }

    pub(crate) async fn woken(&self) {
        self.inner.wake.notified().await;
    }

    /// Start a task that feeds the transport's push events into this
    /// service. `None` when the transport has no events.
    pub fn listen(&self) -> Option<Listener> {
        let events = self.inner.transport.subscribe()?;
        Some(Listener::spawn(self.clone(), events))
    }

    fn announce(&self, changes: Vec<ModelEvent>) {
        for change in changes {
            self.inner.notifier.emit(change);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn export_state(&self) -> StoreSnapshot {
        self.store().export_state()
    }

    pub fn import_state(&self, snapshot: StoreSnapshot) -> Result<()> {
        self.store().import_state(snapshot)?;
        tracing::debug!(service = %self.name(), "State imported");
        Ok(())
    }
}

fn to_records(data: &[Value]) -> perch_engine::Result<Vec<Record>> {
    data.iter().cloned().map(Record::from_value).collect()
}

fn overrides_from(overrides: Option<Value>) -> perch_engine::Result<Option<Fields>> {
    match overrides {
        None => Ok(None),
        Some(Value::Object(fields)) => Ok(Some(fields)),
        Some(_) => Err(perch_engine::Error::InvalidArgument(
            "overrides must be an object".into(),
        )),
    }
}

fn resolve(store: &Store, id: &Id) -> perch_engine::Result<Identity> {
    store
        .identity_of(id)
        .ok_or_else(|| perch_engine::Error::RecordNotFound(id.to_string()))
}

fn stored(store: &Store, identity: &Identity) -> Result<Record> {
    store
        .table()
        .find(identity)
        .cloned()
        .ok_or_else(|| perch_engine::Error::RecordNotFound(identity.to_string()).into())
}

fn changes(store: &Store, result: &ReconcileResult) -> Vec<ModelEvent> {
    let record = |identity: &Identity| store.table().find(identity).cloned();
    let added = result.added.iter().filter_map(record).map(ModelEvent::Added);
    let updated = result
        .updated
        .iter()
        .filter_map(record)
        .map(ModelEvent::Updated);
    let removed = result.removed.iter().cloned().map(ModelEvent::Removed);
    added.chain(updated).chain(removed).collect()
}

fn wall_clock_ms() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
