//! The record store: atomic transactions over immutable record snapshots.
//!
//! Single-writer per document: every mutation serializes through
//! [`Store::transact`], runs to completion, and either commits atomically
//! or aborts with zero observable effect. Readers always see the last
//! committed state — records are immutable snapshots behind `Arc`, so a
//! reader never observes a partial transaction.
//!
//! Commit side effects, in order: the store epoch advances (durable changes
//! only), exactly one [`RecordDiff`] enters the transaction log, record
//! signals update (invalidating computed caches), then per-record listeners
//! and whole-store listeners fire, batched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use easel_signal::{SignalError, SignalGraph, Source};

use crate::diff::RecordDiff;
use crate::log::TransactionLog;
use crate::record::{Record, RecordId, RecordProps, RecordType, SchemaViolation};
use crate::schema::{MigrationFailure, StoreSchema};

/// Store errors. Every variant aborts the smallest enclosing unit (one
/// transaction) without corrupting committed state.
#[derive(Debug)]
pub enum StoreError {
    Schema(SchemaViolation),
    Migration(MigrationFailure),
    Signal(SignalError),
    /// The transaction closure chose to abort.
    Aborted(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Schema(e) => write!(f, "{e}"),
            StoreError::Migration(e) => write!(f, "{e}"),
            StoreError::Signal(e) => write!(f, "{e}"),
            StoreError::Aborted(reason) => write!(f, "transaction aborted: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<SchemaViolation> for StoreError {
    fn from(e: SchemaViolation) -> Self {
        StoreError::Schema(e)
    }
}

impl From<MigrationFailure> for StoreError {
    fn from(e: MigrationFailure) -> Self {
        StoreError::Migration(e)
    }
}

impl From<SignalError> for StoreError {
    fn from(e: SignalError) -> Self {
        StoreError::Signal(e)
    }
}

/// What happened to one record in a commit.
#[derive(Debug)]
pub enum RecordChange<'a> {
    Added(&'a Record),
    Updated { old: &'a Record, new: &'a Record },
    Removed(&'a Record),
}

impl RecordChange<'_> {
    pub fn id(&self) -> &RecordId {
        match self {
            RecordChange::Added(r) => &r.id,
            RecordChange::Updated { new, .. } => &new.id,
            RecordChange::Removed(r) => &r.id,
        }
    }
}

/// Query predicate. `OnPage` and `ChildOf` are served from secondary
/// indexes; `Where` scans the collection.
pub enum Predicate {
    OnPage(RecordId),
    ChildOf(RecordId),
    Where(Box<dyn Fn(&Record) -> bool + Send>),
}

/// Token for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

type StoreListener = Box<dyn FnMut(&RecordDiff) + Send>;
type RecordListener = Box<dyn FnMut(&RecordChange) + Send>;
pub(crate) type AtomMap = Arc<Mutex<HashMap<RecordId, Source<Arc<Record>>>>>;

/// Mutable draft view handed to the transaction closure.
pub struct Transaction<'s> {
    store: &'s Store,
    puts: BTreeMap<RecordId, Record>,
    deletes: BTreeSet<RecordId>,
}

impl Transaction<'_> {
    /// Read a record as the draft sees it.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        if self.deletes.contains(id) {
            return None;
        }
        if let Some(draft) = self.puts.get(id) {
            return Some(draft.clone());
        }
        self.store.get(id).map(|r| (*r).clone())
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    /// Stage a record. Validation runs at commit.
    pub fn put(&mut self, record: Record) {
        self.deletes.remove(&record.id);
        self.puts.insert(record.id.clone(), record);
    }

    pub fn delete(&mut self, id: &RecordId) {
        self.puts.remove(id);
        self.deletes.insert(id.clone());
    }

    pub fn epoch(&self) -> u64 {
        self.store.epoch
    }
}

/// The schema-validated, reactive record database for one document.
pub struct Store {
    schema: Arc<StoreSchema>,
    graph: SignalGraph,
    /// One source signal per live record; shared with computed-cache
    /// closures so their reads register dependencies.
    atoms: AtomMap,
    /// Committed snapshots. `RecordId` orders by collection first, so range
    /// scans serve per-collection iteration.
    records: BTreeMap<RecordId, Arc<Record>>,
    /// Shape ids per page.
    by_page: HashMap<RecordId, BTreeSet<RecordId>>,
    /// Shape ids per parent shape.
    by_parent: HashMap<RecordId, BTreeSet<RecordId>>,
    epoch: u64,
    log: TransactionLog,
    listeners: Vec<(u64, StoreListener)>,
    record_listeners: HashMap<RecordId, Vec<(u64, RecordListener)>>,
    evict_sinks: Vec<Weak<Mutex<Vec<RecordId>>>>,
    next_token: u64,
}

impl Store {
    pub fn new(schema: StoreSchema) -> Self {
        Self {
            schema: Arc::new(schema),
            graph: SignalGraph::new(),
            atoms: Arc::new(Mutex::new(HashMap::new())),
            records: BTreeMap::new(),
            by_page: HashMap::new(),
            by_parent: HashMap::new(),
            epoch: 0,
            log: TransactionLog::new(0),
            listeners: Vec::new(),
            record_listeners: HashMap::new(),
            evict_sinks: Vec::new(),
            next_token: 0,
        }
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    pub fn schema_arc(&self) -> Arc<StoreSchema> {
        self.schema.clone()
    }

    /// Current store epoch — the sync/ordering token for this document.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut TransactionLog {
        &mut self.log
    }

    /// Committed read. Never blocks on a transaction in progress.
    pub fn get(&self, id: &RecordId) -> Option<Arc<Record>> {
        self.records.get(id).cloned()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Build a record stamped with its collection's current schema version.
    pub fn make_record(&self, id: RecordId, props: RecordProps) -> Record {
        let version = self.schema.version_of(props.kind());
        Record::new(id, version, props)
    }

    /// All records of one collection, in id order.
    pub fn records_of(&self, kind: RecordType) -> impl Iterator<Item = Arc<Record>> + '_ {
        let start = RecordId::new(kind, "");
        self.records
            .range(start..)
            .take_while(move |(id, _)| id.kind() == kind)
            .map(|(_, record)| record.clone())
    }

    /// Lazy query over one collection. Indexed predicates avoid the scan.
    pub fn query<'a>(
        &'a self,
        kind: RecordType,
        predicate: Predicate,
    ) -> Box<dyn Iterator<Item = Arc<Record>> + 'a> {
        match predicate {
            Predicate::OnPage(page) => self.indexed(kind, self.by_page.get(&page)),
            Predicate::ChildOf(parent) => self.indexed(kind, self.by_parent.get(&parent)),
            Predicate::Where(filter) => Box::new(
                self.records_of(kind)
                    .filter(move |record| filter(record.as_ref())),
            ),
        }
    }

    fn indexed<'a>(
        &'a self,
        kind: RecordType,
        ids: Option<&'a BTreeSet<RecordId>>,
    ) -> Box<dyn Iterator<Item = Arc<Record>> + 'a> {
        match ids {
            Some(ids) => Box::new(
                ids.iter()
                    .filter(move |id| id.kind() == kind)
                    .filter_map(move |id| self.records.get(id).cloned()),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    /// All durable (persistable) records.
    pub fn durable_records(&self) -> Vec<Record> {
        self.records
            .values()
            .filter(|r| !r.kind().is_ephemeral())
            .map(|r| (**r).clone())
            .collect()
    }

    pub fn presence_records(&self) -> Vec<Record> {
        self.records_of(RecordType::Presence)
            .map(|r| (*r).clone())
            .collect()
    }

    /// Run an atomic transaction. On success, returns the closure result and
    /// the committed diff (empty if the transaction changed nothing).
    pub fn transact<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, StoreError>,
    ) -> Result<(R, RecordDiff), StoreError> {
        let (out, puts, deletes) = {
            let mut txn = Transaction {
                store: self,
                puts: BTreeMap::new(),
                deletes: BTreeSet::new(),
            };
            let out = f(&mut txn)?;
            (out, txn.puts, txn.deletes)
        };

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        for (id, record) in puts {
            let expected = self.schema.version_of(record.kind());
            if record.version != expected {
                return Err(StoreError::Schema(SchemaViolation {
                    record: record.id.clone(),
                    field: "version",
                    message: format!(
                        "record carries v{}, collection is at v{expected}",
                        record.version
                    ),
                }));
            }
            self.schema.validate(&record)?;
            match self.records.get(&id) {
                Some(old) if **old == record => {}
                Some(old) => updated.push(((**old).clone(), record)),
                None => added.push(record),
            }
        }
        for id in deletes {
            if let Some(old) = self.records.get(&id) {
                removed.push((**old).clone());
            }
        }

        if added.is_empty() && updated.is_empty() && removed.is_empty() {
            return Ok((out, RecordDiff::empty(self.epoch)));
        }

        // Ephemeral-only commits apply and notify but do not advance the
        // durable epoch: the epoch is the sync token for the diff log, and
        // presence never enters it.
        let durable_change = added.iter().any(|r| !r.kind().is_ephemeral())
            || updated.iter().any(|(_, r)| !r.kind().is_ephemeral())
            || removed.iter().any(|r| !r.kind().is_ephemeral());
        let from_epoch = self.epoch;
        let to_epoch = if durable_change {
            from_epoch + 1
        } else {
            from_epoch
        };
        let diff = RecordDiff {
            from_epoch,
            to_epoch,
            added,
            updated,
            removed,
        };
        self.commit(&diff);
        Ok((out, diff))
    }

    /// Apply a diff produced elsewhere (the sync layer) as one local
    /// transaction.
    pub fn apply_diff(&mut self, diff: &RecordDiff) -> Result<RecordDiff, StoreError> {
        let (_, applied) = self.transact(|txn| {
            for record in &diff.added {
                txn.put(record.clone());
            }
            for (_, new) in &diff.updated {
                txn.put(new.clone());
            }
            for record in &diff.removed {
                txn.delete(&record.id);
            }
            Ok(())
        })?;
        Ok(applied)
    }

    /// Replace the whole store from a snapshot (bootstrap or resync).
    /// Records must already be at the current schema version.
    pub fn load_snapshot(&mut self, records: Vec<Record>, epoch: u64) -> Result<(), StoreError> {
        for record in &records {
            let expected = self.schema.version_of(record.kind());
            if record.version != expected {
                return Err(StoreError::Schema(SchemaViolation {
                    record: record.id.clone(),
                    field: "version",
                    message: format!(
                        "snapshot record carries v{}, collection is at v{expected}",
                        record.version
                    ),
                }));
            }
            self.schema.validate(record)?;
        }

        let old_records: Vec<Record> = self.records.values().map(|r| (**r).clone()).collect();
        let old_ids: Vec<RecordId> = self.records.keys().cloned().collect();
        let from_epoch = self.epoch;

        let atoms = self.atoms.clone();
        self.graph.batch(|graph| {
            let mut map = match atoms.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            for id in &old_ids {
                if let Some(source) = map.remove(id) {
                    graph.release(source.id());
                }
            }
            for record in &records {
                let source = graph.source(Arc::new(record.clone()));
                map.insert(record.id.clone(), source);
            }
        });
        self.push_evictions(&old_ids);

        self.records = records
            .iter()
            .map(|r| (r.id.clone(), Arc::new(r.clone())))
            .collect();
        self.by_page.clear();
        self.by_parent.clear();
        for record in &records {
            self.index_add(record);
        }
        self.epoch = epoch;
        let durable: Vec<Record> = records
            .iter()
            .filter(|r| !r.kind().is_ephemeral())
            .cloned()
            .collect();
        self.log.reset(durable, epoch);

        let diff = RecordDiff {
            from_epoch,
            to_epoch: epoch,
            added: records,
            updated: Vec::new(),
            removed: old_records,
        };
        self.notify(&diff);
        Ok(())
    }

    /// Subscribe to every committed diff.
    pub fn listen(&mut self, f: impl FnMut(&RecordDiff) + Send + 'static) -> ListenerToken {
        let token = self.next_token;
        self.next_token += 1;
        self.listeners.push((token, Box::new(f)));
        ListenerToken(token)
    }

    /// Subscribe to changes of one record.
    pub fn listen_to(
        &mut self,
        id: &RecordId,
        f: impl FnMut(&RecordChange) + Send + 'static,
    ) -> ListenerToken {
        let token = self.next_token;
        self.next_token += 1;
        self.record_listeners
            .entry(id.clone())
            .or_default()
            .push((token, Box::new(f)));
        ListenerToken(token)
    }

    pub fn unlisten(&mut self, token: ListenerToken) {
        self.listeners.retain(|(t, _)| *t != token.0);
        for listeners in self.record_listeners.values_mut() {
            listeners.retain(|(t, _)| *t != token.0);
        }
    }

    pub(crate) fn graph_mut(&mut self) -> &mut SignalGraph {
        &mut self.graph
    }

    pub(crate) fn graph(&self) -> &SignalGraph {
        &self.graph
    }

    pub(crate) fn atoms_handle(&self) -> AtomMap {
        self.atoms.clone()
    }

    pub(crate) fn register_eviction_sink(&mut self, sink: &Arc<Mutex<Vec<RecordId>>>) {
        self.evict_sinks.push(Arc::downgrade(sink));
    }

    // ── commit machinery ───────────────────────────────────────────

    fn commit(&mut self, diff: &RecordDiff) {
        self.epoch = diff.to_epoch;

        for record in &diff.removed {
            self.records.remove(&record.id);
            self.index_remove(record);
        }
        for record in &diff.added {
            self.records
                .insert(record.id.clone(), Arc::new(record.clone()));
            self.index_add(record);
        }
        for (old, new) in &diff.updated {
            self.records
                .insert(new.id.clone(), Arc::new(new.clone()));
            self.index_remove(old);
            self.index_add(new);
        }

        let durable = diff.durable();
        if !durable.is_empty() {
            if let Err(e) = self.log.append(durable) {
                // Internal invariant: the store only produces contiguous
                // durable diffs.
                log::error!("transaction log rejected diff: {e}");
            }
        }

        let atoms = self.atoms.clone();
        self.graph.batch(|graph| {
            let mut map = match atoms.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            for record in &diff.added {
                let source = graph.source(Arc::new(record.clone()));
                map.insert(record.id.clone(), source);
            }
            for (_, new) in &diff.updated {
                if let Some(source) = map.get(&new.id) {
                    graph.set(source, Arc::new(new.clone()));
                }
            }
            for record in &diff.removed {
                // Releasing the record's signal eagerly frees every computed
                // entry that depends on it.
                if let Some(source) = map.remove(&record.id) {
                    graph.release(source.id());
                }
            }
        });

        let removed_ids: Vec<RecordId> = diff.removed.iter().map(|r| r.id.clone()).collect();
        self.push_evictions(&removed_ids);

        self.notify(diff);
    }

    fn index_add(&mut self, record: &Record) {
        if let RecordProps::Shape(shape) = &record.props {
            self.by_page
                .entry(shape.page.clone())
                .or_default()
                .insert(record.id.clone());
            if let Some(parent) = &shape.parent {
                self.by_parent
                    .entry(parent.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
        }
    }

    fn index_remove(&mut self, record: &Record) {
        if let RecordProps::Shape(shape) = &record.props {
            if let Some(ids) = self.by_page.get_mut(&shape.page) {
                ids.remove(&record.id);
                if ids.is_empty() {
                    self.by_page.remove(&shape.page);
                }
            }
            if let Some(parent) = &shape.parent {
                if let Some(ids) = self.by_parent.get_mut(parent) {
                    ids.remove(&record.id);
                    if ids.is_empty() {
                        self.by_parent.remove(parent);
                    }
                }
            }
        }
    }

    fn push_evictions(&mut self, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        self.evict_sinks.retain(|weak| match weak.upgrade() {
            Some(sink) => {
                if let Ok(mut evicted) = sink.lock() {
                    evicted.extend(ids.iter().cloned());
                }
                true
            }
            None => false,
        });
    }

    /// Per-record listeners first, then whole-store listeners, each in
    /// subscription order.
    fn notify(&mut self, diff: &RecordDiff) {
        for record in &diff.added {
            self.notify_record(&record.id, &RecordChange::Added(record));
        }
        for (old, new) in &diff.updated {
            self.notify_record(&new.id, &RecordChange::Updated { old, new });
        }
        for record in &diff.removed {
            self.notify_record(&record.id, &RecordChange::Removed(record));
        }

        let mut listeners = std::mem::take(&mut self.listeners);
        for (_, listener) in listeners.iter_mut() {
            listener(diff);
        }
        let added = std::mem::take(&mut self.listeners);
        self.listeners = listeners;
        self.listeners.extend(added);
    }

    fn notify_record(&mut self, id: &RecordId, change: &RecordChange) {
        let mut entry = match self.record_listeners.remove(id) {
            Some(listeners) => listeners,
            None => return,
        };
        for (_, listener) in entry.iter_mut() {
            listener(change);
        }
        if let Some(mut newer) = self.record_listeners.remove(id) {
            entry.append(&mut newer);
        }
        self.record_listeners.insert(id.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{sample_page, sample_shape};
    use crate::record::{PageProps, PresenceProps, ShapeProps};
    use std::sync::Mutex as StdMutex;

    fn store_with_page() -> Store {
        let mut store = Store::new(StoreSchema::canvas());
        store
            .transact(|txn| {
                txn.put(sample_page());
                Ok(())
            })
            .unwrap();
        store
    }

    fn presence(key: &str) -> Record {
        Record::new(
            RecordId::new(RecordType::Presence, key),
            1,
            RecordProps::Presence(PresenceProps {
                client: uuid::Uuid::from_u128(7),
                user_name: "Ada".into(),
                color: [0.2, 0.4, 0.6, 1.0],
                cursor: Some([1.0, 2.0]),
                selection: Vec::new(),
            }),
        )
    }

    #[test]
    fn test_commit_bumps_epoch_and_emits_one_diff() {
        let mut store = Store::new(StoreSchema::canvas());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        store.listen(move |diff: &RecordDiff| {
            seen2.lock().unwrap().push(diff.clone());
        });

        let (_, diff) = store
            .transact(|txn| {
                txn.put(sample_page());
                txn.put(sample_shape("s1"));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.epoch(), 1);
        assert_eq!(diff.from_epoch, 0);
        assert_eq!(diff.to_epoch, 1);
        assert_eq!(diff.added.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.log().head_epoch(), 1);
    }

    #[test]
    fn test_aborted_transaction_has_zero_effect() {
        let mut store = store_with_page();
        let epoch = store.epoch();
        let fired = Arc::new(StdMutex::new(0usize));
        let fired2 = fired.clone();
        store.listen(move |_: &RecordDiff| {
            *fired2.lock().unwrap() += 1;
        });

        let result = store.transact(|txn| {
            txn.put(sample_shape("s1"));
            Err::<(), _>(StoreError::Aborted("nope".into()))
        });

        assert!(result.is_err());
        assert_eq!(store.epoch(), epoch);
        assert!(!store.contains(&RecordId::new(RecordType::Shape, "s1")));
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn test_validation_failure_aborts_and_names_field() {
        let mut store = store_with_page();
        let mut bad = sample_shape("s1");
        if let RecordProps::Shape(p) = &mut bad.props {
            p.opacity = 7.0;
        }
        let err = store
            .transact(|txn| {
                txn.put(sample_shape("ok"));
                txn.put(bad.clone());
                Ok(())
            })
            .unwrap_err();
        match err {
            StoreError::Schema(violation) => assert_eq!(violation.field, "opacity"),
            other => panic!("expected schema violation, got {other:?}"),
        }
        // The valid record in the same transaction must not have landed.
        assert!(!store.contains(&RecordId::new(RecordType::Shape, "ok")));
    }

    #[test]
    fn test_stale_version_rejected() {
        let mut store = store_with_page();
        let mut stale = sample_shape("s1");
        stale.version = 1;
        let err = store
            .transact(|txn| {
                txn.put(stale.clone());
                Ok(())
            })
            .unwrap_err();
        match err {
            StoreError::Schema(violation) => assert_eq!(violation.field, "version"),
            other => panic!("expected version violation, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_put_is_empty_commit() {
        let mut store = store_with_page();
        let epoch = store.epoch();
        let (_, diff) = store
            .transact(|txn| {
                txn.put(sample_page());
                Ok(())
            })
            .unwrap();
        assert!(diff.is_empty());
        assert_eq!(store.epoch(), epoch);
    }

    #[test]
    fn test_draft_reads_see_pending_writes() {
        let mut store = store_with_page();
        store
            .transact(|txn| {
                let shape = sample_shape("s1");
                let id = shape.id.clone();
                txn.put(shape);
                assert!(txn.contains(&id));
                txn.delete(&id);
                assert!(!txn.contains(&id));
                Ok(())
            })
            .unwrap();
        assert!(!store.contains(&RecordId::new(RecordType::Shape, "s1")));
    }

    #[test]
    fn test_listener_order_record_then_store() {
        let mut store = store_with_page();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let shape = sample_shape("s1");

        let o1 = order.clone();
        store.listen_to(&shape.id, move |_: &RecordChange| {
            o1.lock().unwrap().push("record");
        });
        let o2 = order.clone();
        store.listen(move |_: &RecordDiff| {
            o2.lock().unwrap().push("store");
        });

        store
            .transact(|txn| {
                txn.put(shape.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["record", "store"]);
    }

    #[test]
    fn test_unlisten() {
        let mut store = store_with_page();
        let fired = Arc::new(StdMutex::new(0usize));
        let fired2 = fired.clone();
        let token = store.listen(move |_: &RecordDiff| {
            *fired2.lock().unwrap() += 1;
        });
        store.unlisten(token);
        store
            .transact(|txn| {
                txn.put(sample_shape("s1"));
                Ok(())
            })
            .unwrap();
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn test_presence_only_commit_keeps_epoch_and_log() {
        let mut store = store_with_page();
        let epoch = store.epoch();
        let head = store.log().head_epoch();

        let (_, diff) = store
            .transact(|txn| {
                txn.put(presence("c1"));
                Ok(())
            })
            .unwrap();

        assert!(!diff.is_empty());
        assert_eq!(diff.from_epoch, diff.to_epoch);
        assert_eq!(store.epoch(), epoch);
        assert_eq!(store.log().head_epoch(), head);
        assert!(store.contains(&RecordId::new(RecordType::Presence, "c1")));
    }

    #[test]
    fn test_query_on_page_uses_index() {
        let mut store = Store::new(StoreSchema::canvas());
        let page2 = Record::new(
            RecordId::new(RecordType::Page, "p2"),
            2,
            RecordProps::Page(PageProps {
                name: "Page 2".into(),
                index: 1,
            }),
        );
        let mut on_p2 = sample_shape("s2");
        if let RecordProps::Shape(p) = &mut on_p2.props {
            p.page = page2.id.clone();
        }
        store
            .transact(|txn| {
                txn.put(sample_page());
                txn.put(page2.clone());
                txn.put(sample_shape("s1"));
                txn.put(on_p2.clone());
                Ok(())
            })
            .unwrap();

        let hits: Vec<Arc<Record>> = store
            .query(
                RecordType::Shape,
                Predicate::OnPage(RecordId::new(RecordType::Page, "p2")),
            )
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, on_p2.id);
    }

    #[test]
    fn test_query_child_of_index_tracks_updates() {
        let mut store = store_with_page();
        let parent = sample_shape("parent");
        let mut child = sample_shape("child");
        if let RecordProps::Shape(p) = &mut child.props {
            p.parent = Some(parent.id.clone());
        }
        store
            .transact(|txn| {
                txn.put(parent.clone());
                txn.put(child.clone());
                Ok(())
            })
            .unwrap();

        let children: Vec<Arc<Record>> = store
            .query(RecordType::Shape, Predicate::ChildOf(parent.id.clone()))
            .collect();
        assert_eq!(children.len(), 1);

        // Re-parent: the index updates incrementally with the commit.
        let mut orphaned = child.clone();
        if let RecordProps::Shape(p) = &mut orphaned.props {
            p.parent = None;
        }
        store
            .transact(|txn| {
                txn.put(orphaned);
                Ok(())
            })
            .unwrap();
        let children: Vec<Arc<Record>> = store
            .query(RecordType::Shape, Predicate::ChildOf(parent.id.clone()))
            .collect();
        assert!(children.is_empty());
    }

    #[test]
    fn test_query_where_scans() {
        let mut store = store_with_page();
        store
            .transact(|txn| {
                txn.put(sample_shape("a"));
                let mut far = sample_shape("b");
                if let RecordProps::Shape(p) = &mut far.props {
                    p.x = 1000.0;
                }
                txn.put(far);
                Ok(())
            })
            .unwrap();

        let far: Vec<Arc<Record>> = store
            .query(
                RecordType::Shape,
                Predicate::Where(Box::new(|record| {
                    matches!(&record.props, RecordProps::Shape(p) if p.x > 500.0)
                })),
            )
            .collect();
        assert_eq!(far.len(), 1);
        assert_eq!(far[0].id.key(), "b");
    }

    #[test]
    fn test_replaying_diffs_reproduces_state() {
        let mut store = store_with_page();
        let diffs = Arc::new(StdMutex::new(Vec::new()));
        let sink = diffs.clone();
        store.listen(move |diff: &RecordDiff| {
            sink.lock().unwrap().push(diff.clone());
        });

        store
            .transact(|txn| {
                txn.put(sample_shape("s1"));
                txn.put(sample_shape("s2"));
                Ok(())
            })
            .unwrap();
        store
            .transact(|txn| {
                let id = RecordId::new(RecordType::Shape, "s1");
                let mut moved = txn.get(&id).unwrap();
                if let RecordProps::Shape(p) = &mut moved.props {
                    p.x = 99.0;
                }
                txn.put(moved);
                txn.delete(&RecordId::new(RecordType::Shape, "s2"));
                Ok(())
            })
            .unwrap();

        // Replay the captured diffs onto a store bootstrapped the same way.
        let mut replica = store_with_page();
        for diff in diffs.lock().unwrap().iter() {
            replica.apply_diff(diff).unwrap();
        }

        let originals: Vec<Record> = store.durable_records();
        let replayed: Vec<Record> = replica.durable_records();
        assert_eq!(originals, replayed);
    }

    #[test]
    fn test_load_snapshot_replaces_wholesale() {
        let mut store = store_with_page();
        store
            .transact(|txn| {
                txn.put(sample_shape("old"));
                Ok(())
            })
            .unwrap();

        let snapshot = vec![sample_page(), sample_shape("new")];
        store.load_snapshot(snapshot, 50).unwrap();

        assert_eq!(store.epoch(), 50);
        assert_eq!(store.log().base_epoch(), 50);
        assert!(store.contains(&RecordId::new(RecordType::Shape, "new")));
        assert!(!store.contains(&RecordId::new(RecordType::Shape, "old")));
    }

    #[test]
    fn test_make_record_stamps_current_version() {
        let store = Store::new(StoreSchema::canvas());
        let record = store.make_record(
            RecordId::new(RecordType::Shape, "s1"),
            RecordProps::Shape(ShapeProps {
                page: RecordId::new(RecordType::Page, "p1"),
                parent: None,
                x: 0.0,
                y: 0.0,
                rotation: 0.0,
                opacity: 1.0,
                geo: crate::record::ShapeKind::Rect { w: 1.0, h: 1.0 },
                asset: None,
            }),
        );
        assert_eq!(record.version, 2);
    }
}
