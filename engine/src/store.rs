//! Store - the cache of one namespace.
//!
//! The Store composes the entity table, the copy manager, pending state,
//! pagination state and the event queue. Every write goes through it so that
//! removals cascade to copies and pagination, promotions re-key copies, and
//! the revision counter moves. Query results are memoized per distinct params
//! until the next revision.

use crate::{
    error::Result, CopyManager, CopyStorage, Debounce, EntityTable, Error, EventKind, EventQueue,
    Fields, Id, IdFields, Identity, Method, Model, PageInfo, Pagination, Params, PendingTracker,
    Query, QueryOptions, QueryResult, ReconcileResult, Reconciler, Record, Timestamp,
    TransportError,
};
use std::cell::RefCell;
use std::collections::HashMap;

/// Construction options of a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    namespace: String,
    model: Model,
    copy_storage: CopyStorage,
    query_options: QueryOptions,
    debounce: Option<Debounce>,
    auto_remove: bool,
}

impl StoreConfig {
    pub fn new(namespace: impl Into<String>, model: Model) -> Self {
        Self {
            namespace: namespace.into(),
            model,
            copy_storage: CopyStorage::default(),
            query_options: QueryOptions::default(),
            debounce: None,
            auto_remove: false,
        }
    }

    pub fn copy_storage(mut self, storage: CopyStorage) -> Self {
        self.copy_storage = storage;
        self
    }

    pub fn query_options(mut self, options: QueryOptions) -> Self {
        self.query_options = options;
        self
    }

    pub fn debounce(mut self, debounce: Option<Debounce>) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }
}

#[derive(Debug, Default)]
struct Memo {
    revision: u64,
    results: HashMap<String, QueryResult>,
}

/// The cache of one namespace.
#[derive(Debug)]
pub struct Store {
    namespace: String,
    table: EntityTable,
    copies: CopyManager,
    pending: PendingTracker,
    pagination: Pagination,
    events: EventQueue,
    query_options: QueryOptions,
    reconciler: Reconciler,
    revision: u64,
    memo: RefCell<Memo>,
}

impl Store {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            namespace: config.namespace,
            table: EntityTable::new(config.model),
            copies: CopyManager::new(config.copy_storage),
            pending: PendingTracker::new(),
            pagination: Pagination::new(),
            events: EventQueue::new(config.debounce),
            query_options: config.query_options,
            reconciler: Reconciler::new(config.auto_remove),
            revision: 0,
            memo: RefCell::new(Memo::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> &Model {
        self.table.model()
    }

    pub fn id_fields(&self) -> &IdFields {
        self.table.model().id_fields()
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    pub fn copies(&self) -> &CopyManager {
        &self.copies
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    pub fn pagination(&self) -> &Pagination {
        &self.pagination
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    /// Incremented on every change to records or copies.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Upsert one record. Returns its identity after any promotion.
    pub fn add_or_update(&mut self, record: Record) -> Identity {
        let upserted = self.table.upsert(record);
        if let Some(temp) = &upserted.promoted_from {
            self.rekey_copy(&Identity::Temporary(temp.clone()), &upserted.identity);
        }
        self.bump();
        upserted.identity
    }

    /// Merge a fetched list. Pages never trigger auto-remove.
    pub fn add_or_update_all(&mut self, records: Vec<Record>, paginated: bool) -> ReconcileResult {
        let result = self.reconciler.reconcile(&mut self.table, records, paginated);
        self.cascade(&result);
        self.bump();
        result
    }

    /// Stage a record in the temporary partition ahead of a create.
    pub fn add_temp(&mut self, record: Record) -> Identity {
        let identity = self.table.upsert_temp(record).identity;
        self.bump();
        identity
    }

    /// Promote a temp record with the created record's data.
    pub fn promote_temp(&mut self, temp_id: &Id, permanent: Record) -> Identity {
        let upserted = self.table.promote_temp(temp_id, permanent);
        if upserted.promoted_from.is_some() {
            self.rekey_copy(&Identity::Temporary(temp_id.clone()), &upserted.identity);
        }
        self.bump();
        upserted.identity
    }

    /// Remove an id from every partition, together with its copies. The id
    /// also leaves every pagination page, cached or not.
    pub fn remove(&mut self, id: &Id) -> Vec<Identity> {
        let removed = self.table.remove(id);
        self.cascade_removed(&removed);
        self.pagination.forget(id);
        self.bump();
        removed
    }

    /// Remove a record by its permanent and temporary ids.
    pub fn remove_record(&mut self, record: &Record) -> Vec<Identity> {
        let removed = self.table.remove_record(record);
        self.cascade_removed(&removed);
        self.bump();
        removed
    }

    /// Drop all records, copies, pagination and queued events.
    pub fn clear_all(&mut self) {
        self.table.clear();
        self.copies.clear();
        self.pagination.clear();
        self.events.clear();
        self.bump();
    }

    fn cascade(&mut self, result: &ReconcileResult) {
        for (temp, permanent) in &result.promoted {
            self.rekey_copy(temp, permanent);
        }
        self.cascade_removed(&result.removed);
    }

    fn cascade_removed(&mut self, removed: &[Identity]) {
        for identity in removed {
            self.copies.discard(identity);
            if identity.is_permanent() {
                self.pagination.forget(identity.id());
            }
        }
    }

    fn rekey_copy(&mut self, temp: &Identity, permanent: &Identity) {
        let id_fields = self.table.model().id_fields();
        let id_value = self
            .table
            .find(permanent)
            .and_then(|record| record.field(&id_fields.id_field))
            .cloned();
        self.copies
            .rekey(temp, permanent, id_fields, id_value.as_ref());
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A stored record by id: permanent partition first, then temps.
    pub fn get(&self, id: &Id) -> Option<&Record> {
        self.table.get(id).or_else(|| self.table.get_temp(id))
    }

    /// Identity under which `id` is currently stored.
    pub fn identity_of(&self, id: &Id) -> Option<Identity> {
        if self.table.get(id).is_some() {
            Some(Identity::Permanent(id.clone()))
        } else if self.table.get_temp(id).is_some() {
            Some(Identity::Temporary(id.clone()))
        } else {
            None
        }
    }

    /// Look a record up with `copies` and `$select` applied.
    pub fn get_from_store(&self, id: &Id, params: &Params) -> Result<Option<Record>> {
        let Some(identity) = self.identity_of(id) else {
            return Ok(None);
        };
        let query = Query::parse(params.query.as_ref(), &self.query_options)?;

        let record = match self.copies.get(&identity) {
            Some(copy) if params.copies => copy,
            _ => match self.table.find(&identity) {
                Some(record) => record,
                None => return Ok(None),
            },
        };
        let projected = query.project(vec![record.clone()], self.id_fields());
        Ok(projected.into_iter().next().map(|r| self.instantiate(r)))
    }

    /// Query the cache. Results are memoized until the next write.
    pub fn find_in_store(&self, params: &Params) -> Result<QueryResult> {
        let key = serde_json::to_string(params)
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        {
            let memo = self.memo.borrow();
            if memo.revision == self.revision {
                if let Some(hit) = memo.results.get(&key) {
                    return Ok(hit.clone());
                }
            }
        }

        let result = self.run_query(params)?;

        let mut memo = self.memo.borrow_mut();
        if memo.revision != self.revision {
            memo.results.clear();
            memo.revision = self.revision;
        }
        memo.results.insert(key, result.clone());
        Ok(result)
    }

    fn run_query(&self, params: &Params) -> Result<QueryResult> {
        let query = Query::parse(params.query.as_ref(), &self.query_options)?;

        let mut candidates: Vec<&Record> = self.table.list().collect();
        if params.temps {
            candidates.extend(self.table.temps());
        }

        let mut matched: Vec<Record> = candidates
            .into_iter()
            .filter(|record| query.matches(record))
            .map(|record| self.substitute_copy(record, params.copies))
            .collect();
        let total = matched.len();

        query.sort(&mut matched);
        let page = query.paginate(matched);
        let data = query
            .project(page, self.id_fields())
            .into_iter()
            .map(|record| self.instantiate(record))
            .collect();

        Ok(QueryResult {
            total,
            limit: query.limit(),
            skip: query.skip(),
            data,
        })
    }

    fn substitute_copy(&self, record: &Record, copies: bool) -> Record {
        if copies {
            let copy = self
                .id_fields()
                .identify(record.fields())
                .and_then(|identity| self.copies.get(&identity));
            if let Some(copy) = copy {
                return copy.clone();
            }
        }
        record.clone()
    }

    /// Number of matches, ignoring pagination keys.
    pub fn count_in_store(&self, params: &Params) -> Result<usize> {
        let Some(query) = params.query.as_ref() else {
            return Err(Error::invalid_argument("params must contain a query object"));
        };
        let query = Query::parse(Some(query), &self.query_options)?.without_pagination();

        let permanent = self.table.list().filter(|r| query.matches(r)).count();
        let temps = if params.temps {
            self.table.temps().filter(|r| query.matches(r)).count()
        } else {
            0
        };
        Ok(permanent + temps)
    }

    /// Build a model instance without inserting it.
    pub fn instantiate(&self, record: Record) -> Record {
        self.table.model().instantiate(record)
    }

    // ========================================================================
    // Copies
    // ========================================================================

    /// The working copy of `identity`, created on first use.
    pub fn clone_record(&mut self, identity: &Identity, overrides: Option<&Fields>) -> Result<Record> {
        let copy = self
            .copies
            .clone_of(&self.table, identity, overrides)?
            .clone();
        self.bump();
        Ok(copy)
    }

    /// [`Store::clone_record`] for a record value. Copies cannot be cloned.
    pub fn clone_of_record(&mut self, record: &Record, overrides: Option<&Fields>) -> Result<Record> {
        if record.is_copy() {
            return Err(Error::invalid_operation("cannot clone a copy"));
        }
        let identity = self.identity_for(record)?;
        self.clone_record(&identity, overrides)
    }

    /// [`Store::reset`] for a copy value.
    pub fn reset_copy(&mut self, copy: &Record) -> Result<Record> {
        if !copy.is_copy() {
            return Err(Error::invalid_operation("cannot reset a record that is not a copy"));
        }
        let identity = self.identity_for(copy)?;
        self.reset(&identity)
    }

    /// Write an edited copy value into its source. The copy's edits replace
    /// the registered copy first, then it is committed.
    pub fn commit_copy(&mut self, copy: &Record) -> Result<Record> {
        if !copy.is_copy() {
            return Err(Error::invalid_operation("cannot commit a record that is not a copy"));
        }
        let identity = self.identity_for(copy)?;
        self.copies.put(&identity, copy)?;
        self.commit(&identity)
    }

    fn identity_for(&self, record: &Record) -> Result<Identity> {
        let identity = self
            .id_fields()
            .identify(record.fields())
            .ok_or_else(|| Error::invalid_argument("record has no id or temp id"))?;
        Ok(self.identity_of(identity.id()).unwrap_or(identity))
    }

    pub fn copy(&self, identity: &Identity) -> Option<&Record> {
        self.copies.get(identity)
    }

    /// Re-clone a copy from its source.
    pub fn reset(&mut self, identity: &Identity) -> Result<Record> {
        let copy = self.copies.reset(&self.table, identity)?.clone();
        self.bump();
        Ok(copy)
    }

    /// Write a copy into its source. Returns the updated source.
    pub fn commit(&mut self, identity: &Identity) -> Result<Record> {
        let target = self.copies.commit(&mut self.table, identity)?;
        self.bump();
        self.table
            .find(&target)
            .cloned()
            .ok_or_else(|| Error::RecordNotFound(target.to_string()))
    }

    /// Replace a registered copy's data with an edited copy.
    pub fn put_copy(&mut self, identity: &Identity, edited: &Record) -> Result<Record> {
        let copy = self.copies.put(identity, edited)?.clone();
        self.bump();
        Ok(copy)
    }

    pub fn discard_copy(&mut self, identity: &Identity) -> Option<Record> {
        let discarded = self.copies.discard(identity);
        if discarded.is_some() {
            self.bump();
        }
        discarded
    }

    // ========================================================================
    // Pending state
    // ========================================================================

    pub fn begin(&mut self, method: Method, identity: Option<&Identity>) {
        self.pending.begin(method, identity);
    }

    pub fn settle(&mut self, method: Method, identity: Option<&Identity>) {
        self.pending.settle(method, identity);
    }

    pub fn fail(&mut self, method: Method, identity: Option<&Identity>, error: TransportError) {
        self.pending.fail(method, identity, error);
    }

    pub fn clear_error(&mut self, method: Method) {
        self.pending.clear_error(method);
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Queue a push event. Applies it right away when not debouncing.
    ///
    /// Removals without any identity are dropped.
    pub fn enqueue_event(
        &mut self,
        kind: EventKind,
        record: Record,
        now: Timestamp,
    ) -> Option<ReconcileResult> {
        let mut fields = record.into_fields();
        let identity = if kind.is_removal() {
            self.id_fields().identify(&fields)?
        } else {
            self.id_fields().ensure_identity(&mut fields)
        };
        let flush = self
            .events
            .enqueue(kind, identity, Record::new(fields), now)?;
        Some(self.apply_flush(flush))
    }

    /// Apply every event lane whose deadline has passed.
    pub fn flush_due(&mut self, now: Timestamp) -> Option<ReconcileResult> {
        let flush = self.events.take_due(now)?;
        Some(self.apply_flush(flush))
    }

    /// Apply all queued events now.
    pub fn flush_events(&mut self) -> Option<ReconcileResult> {
        let flush = self.events.drain()?;
        Some(self.apply_flush(flush))
    }

    pub fn next_event_deadline(&self) -> Option<Timestamp> {
        self.events.next_deadline()
    }

    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    fn apply_flush(&mut self, flush: crate::Flush) -> ReconcileResult {
        let result = self.reconciler.apply_flush(&mut self.table, flush);
        self.cascade(&result);
        self.bump();
        result
    }

    // ========================================================================
    // Pagination
    // ========================================================================

    /// Record the page a paginated find returned.
    pub fn update_pagination(
        &mut self,
        params: &Params,
        ids: Vec<Id>,
        total: usize,
        limit: Option<usize>,
        skip: usize,
        now: Timestamp,
    ) {
        let page = PageInfo {
            query: params.query.clone().unwrap_or_default(),
            ids,
            total,
            limit,
            skip,
            queried_at: now,
        };
        self.pagination.record(params.qid.as_deref(), page);
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Export records, pending state and pagination. Copies are included
    /// only when they are kept in the store.
    pub fn export_state(&self) -> crate::StoreSnapshot {
        crate::StoreSnapshot::capture(self)
    }

    /// Replace the store's state with a snapshot.
    pub fn import_state(&mut self, snapshot: crate::StoreSnapshot) -> Result<()> {
        snapshot.validate(&self.namespace)?;

        self.table.clear();
        self.copies.clear();
        for id in &snapshot.ids {
            if let Some(fields) = snapshot.records.get(id) {
                self.table.upsert(Record::new(fields.clone()));
            }
        }
        for id in &snapshot.temp_ids {
            if let Some(fields) = snapshot.temps.get(id) {
                self.table.upsert_temp(Record::new(fields.clone()));
            }
        }
        if self.copies.storage() == CopyStorage::InStore {
            for entry in snapshot.copies {
                let copy = self.table.model().build(entry.fields);
                self.copies.restore(entry.identity, copy);
            }
        }
        self.pending = snapshot.pending;
        self.pagination = snapshot.pagination;
        self.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn store() -> Store {
        Store::new(StoreConfig::new("items", Model::new("Item")))
    }

    fn ids(result: &QueryResult) -> Vec<Value> {
        result
            .data
            .iter()
            .map(|r| r.field("id").cloned().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn find_in_store_follows_insertion_order() {
        let mut store = store();
        store.add_or_update(record(json!({"id": 1, "x": 1})));
        store.add_or_update(record(json!({"id": 2, "x": 2})));
        store.add_or_update(record(json!({"id": 3, "x": 1})));

        let result = store
            .find_in_store(&Params::from_query(json!({"x": 1})))
            .unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(ids(&result), vec![json!(1), json!(3)]);
    }

    #[test]
    fn memoized_results_invalidate_on_write() {
        let mut store = store();
        store.add_or_update(record(json!({"id": 1})));
        let params = Params::new();

        let first = store.find_in_store(&params).unwrap();
        let again = store.find_in_store(&params).unwrap();
        assert_eq!(first, again);

        store.add_or_update(record(json!({"id": 2})));
        assert_eq!(store.find_in_store(&params).unwrap().total, 2);
    }

    #[test]
    fn temps_are_excluded_by_default() {
        let mut store = store();
        store.add_or_update(record(json!({"id": 1})));
        store.add_temp(record(json!({"name": "draft"})));

        assert_eq!(store.find_in_store(&Params::new()).unwrap().total, 1);
        assert_eq!(
            store.find_in_store(&Params::new().with_temps()).unwrap().total,
            2
        );
    }

    #[test]
    fn copies_flag_substitutes_copies() {
        let mut store = store();
        let identity = store.add_or_update(record(json!({"id": 1, "name": "a"})));
        let overrides = record(json!({"name": "edited"}));
        store
            .clone_record(&identity, Some(overrides.fields()))
            .unwrap();

        let plain = store.find_in_store(&Params::new()).unwrap();
        assert_eq!(plain.data[0].field("name"), Some(&json!("a")));

        let with_copies = store.find_in_store(&Params::new().with_copies()).unwrap();
        assert_eq!(with_copies.data[0].field("name"), Some(&json!("edited")));
        assert!(with_copies.data[0].is_copy());
    }

    #[test]
    fn count_requires_query_and_ignores_pagination() {
        let mut store = store();
        for id in 1..=5 {
            store.add_or_update(record(json!({"id": id, "even": id % 2 == 0})));
        }

        assert!(matches!(
            store.count_in_store(&Params::new()),
            Err(Error::InvalidArgument(_))
        ));
        let params = Params::from_query(json!({"even": false, "$limit": 1, "$skip": 1}));
        assert_eq!(store.count_in_store(&params).unwrap(), 3);
    }

    #[test]
    fn remove_cascades_to_copies() {
        let mut store = store();
        let identity = store.add_or_update(record(json!({"id": 1})));
        store.clone_record(&identity, None).unwrap();

        store.remove(&Id::from(1));

        assert!(store.copy(&identity).is_none());
        assert!(store.get(&Id::from(1)).is_none());
        // idempotent
        assert!(store.remove(&Id::from(1)).is_empty());
    }

    #[test]
    fn promote_rekeys_copy() {
        let mut store = store();
        let temp = store.add_temp(record(json!({"name": "draft"})));
        store.clone_record(&temp, None).unwrap();

        let permanent = store.promote_temp(temp.id(), record(json!({"id": 7, "name": "draft"})));

        assert!(store.copy(&temp).is_none());
        let copy = store.copy(&permanent).unwrap();
        assert_eq!(copy.field("id"), Some(&json!(7)));
    }

    #[test]
    fn get_from_store_applies_select_and_copies() {
        let mut store = store();
        let identity = store.add_or_update(record(json!({"id": 1, "name": "a", "age": 3})));
        store.clone_record(&identity, None).unwrap();

        let params = Params::from_query(json!({"$select": ["name"]})).with_copies();
        let found = store.get_from_store(&Id::from(1), &params).unwrap().unwrap();
        assert_eq!(found.to_json(), json!({"name": "a", "id": 1}));
        assert!(store.model().is_instance(&found));

        assert!(store
            .get_from_store(&Id::from(9), &Params::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn commit_returns_updated_source() {
        let mut store = store();
        let identity = store.add_or_update(record(json!({"id": 1, "name": "a"})));
        let mut copy = store.clone_record(&identity, None).unwrap();
        copy.set("name", json!("b"));
        store.put_copy(&identity, &copy).unwrap();

        let committed = store.commit(&identity).unwrap();
        assert_eq!(committed.field("name"), Some(&json!("b")));
        assert!(!committed.is_copy());
        assert!(store.copy(&identity).is_none());
    }

    #[test]
    fn debounced_events_apply_on_flush() {
        let mut store = Store::new(
            StoreConfig::new("items", Model::new("Item")).debounce(Some(Debounce::new(20))),
        );
        for name in ["a", "b"] {
            let applied =
                store.enqueue_event(EventKind::Created, record(json!({"id": 1, "name": name})), 0);
            assert!(applied.is_none());
        }
        assert!(store.get(&Id::from(1)).is_none());
        assert_eq!(store.next_event_deadline(), Some(20));

        let applied = store.flush_due(20).unwrap();
        assert_eq!(applied.added.len(), 1);
        assert_eq!(store.get(&Id::from(1)).unwrap().field("name"), Some(&json!("b")));
    }

    #[test]
    fn removal_event_without_identity_is_dropped() {
        let mut store = store();
        assert!(store
            .enqueue_event(EventKind::Removed, record(json!({"name": "x"})), 0)
            .is_none());
    }

    #[test]
    fn auto_remove_only_for_complete_lists() {
        let mut store = Store::new(StoreConfig::new("items", Model::new("Item")).auto_remove(true));
        store.add_or_update(record(json!({"id": 1})));
        store.add_or_update(record(json!({"id": 2})));

        store.add_or_update_all(vec![record(json!({"id": 2}))], true);
        assert_eq!(store.table().len(), 2);

        store.add_or_update_all(vec![record(json!({"id": 2}))], false);
        assert_eq!(store.table().ids(), &[Id::from(2)]);
    }

    #[test]
    fn pagination_state_by_qid() {
        let mut store = store();
        let params = Params::from_query(json!({"$limit": 2})).with_qid("list");
        store.update_pagination(&params, vec![Id::from(1), Id::from(2)], 10, Some(2), 0, 99);

        let page = store.pagination().get("list").unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.queried_at, 99);
        assert_eq!(page.query.get("$limit"), Some(&json!(2)));

        // Id 1 was only ever paged, never cached
        store.remove(&Id::from(1));
        assert_eq!(store.pagination().get("list").unwrap().ids, vec![Id::from(2)]);
    }

    #[test]
    fn record_copy_entry_points_check_copy_state() {
        let mut store = store();
        store.add_or_update(record(json!({"id": 1, "title": "a"})));
        let source = store.get(&Id::from(1)).cloned().unwrap();

        let mut copy = store.clone_of_record(&source, None).unwrap();
        assert!(copy.is_copy());
        assert!(matches!(
            store.clone_of_record(&copy, None),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(store.reset_copy(&source), Err(Error::InvalidOperation(_))));
        assert!(matches!(store.commit_copy(&source), Err(Error::InvalidOperation(_))));

        copy.set("title", json!("b"));
        let committed = store.commit_copy(&copy).unwrap();
        assert_eq!(committed.field("title"), Some(&json!("b")));
        assert!(store.copy(&Identity::Permanent(Id::from(1))).is_none());
    }

    #[test]
    fn record_copy_entry_points_need_an_id() {
        let mut store = store();
        let anonymous = record(json!({"title": "a"}));
        assert!(matches!(
            store.clone_of_record(&anonymous, None),
            Err(Error::InvalidArgument(_))
        ));
    }
}
