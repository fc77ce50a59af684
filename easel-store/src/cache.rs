//! Per-record computed caches riding the signal graph.
//!
//! Each cache entry is a derived signal whose dependency set is discovered
//! by what the computing closure reads: the backing record itself plus any
//! other records fetched through [`RecordCtx::record`]. The entry therefore
//! recomputes exactly when one of those records changes.
//!
//! Lifecycle: entries appear on first access and are never precomputed.
//! When a record is deleted the store releases its signal, which eagerly
//! frees every dependent entry's cached value; the cache's id map is swept
//! through an eviction sink the store feeds on each delete.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use easel_signal::{Derived, SignalError, SignalScope};

use crate::record::{Record, RecordId};
use crate::store::{AtomMap, Store};

/// Tracked read access to the store for computing closures.
pub struct RecordCtx<'a, 'g> {
    scope: &'a mut SignalScope<'g>,
    atoms: &'a AtomMap,
}

impl RecordCtx<'_, '_> {
    /// Read another record, registering it as a dependency of the entry
    /// being computed. `None` if the record does not exist.
    pub fn record(&mut self, id: &RecordId) -> Option<Arc<Record>> {
        let source = {
            let map = match self.atoms.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.get(id).copied()
        }?;
        self.scope.get(&source)
    }
}

type ComputeFn<T> = Arc<dyn Fn(&mut RecordCtx<'_, '_>, &Record) -> T + Send + Sync>;

/// A named, memoized record → value mapping.
pub struct ComputedCache<T> {
    name: String,
    compute: ComputeFn<T>,
    entries: HashMap<RecordId, Derived<T>>,
    evicted: Arc<Mutex<Vec<RecordId>>>,
}

impl<T> ComputedCache<T>
where
    T: PartialEq + Clone + Send + 'static,
{
    pub fn new<F>(store: &mut Store, name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&mut RecordCtx<'_, '_>, &Record) -> T + Send + Sync + 'static,
    {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        store.register_eviction_sink(&evicted);
        Self {
            name: name.into(),
            compute: Arc::new(compute),
            entries: HashMap::new(),
            evicted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The computed value for a record. `None` for unknown ids; an error
    /// only if the computing closure read a record that vanished mid-flight
    /// or formed a cycle.
    pub fn get(&mut self, store: &mut Store, id: &RecordId) -> Option<Result<T, SignalError>> {
        self.sweep();
        if !store.contains(id) {
            self.entries.remove(id);
            return None;
        }
        let entry = match self.entries.get(id) {
            Some(entry) if store.graph().contains(entry.id()) => *entry,
            _ => {
                let entry = Self::make_entry(store, id.clone(), self.compute.clone());
                self.entries.insert(id.clone(), entry);
                entry
            }
        };
        Some(store.graph_mut().read(&entry))
    }

    fn make_entry(store: &mut Store, id: RecordId, compute: ComputeFn<T>) -> Derived<T> {
        let atoms = store.atoms_handle();
        store.graph_mut().derived(move |scope| {
            let source = {
                let map = match atoms.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.get(&id).copied()
            };
            let source = match source {
                Some(source) => source,
                None => {
                    return Err(SignalError::Compute(format!(
                        "record {id} is gone"
                    )))
                }
            };
            let record = match scope.get(&source) {
                Some(record) => record,
                None => {
                    return Err(SignalError::Compute(format!(
                        "record {id} is gone"
                    )))
                }
            };
            let mut ctx = RecordCtx {
                scope,
                atoms: &atoms,
            };
            Ok(compute(&mut ctx, &record))
        })
    }

    /// Drop map entries whose records were deleted. Their derived signals
    /// were already released by the store at delete time.
    fn sweep(&mut self) {
        let evicted: Vec<RecordId> = match self.evicted.lock() {
            Ok(mut evicted) => evicted.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for id in evicted {
            self.entries.remove(&id);
        }
    }
}

impl Store {
    /// Create a named computed cache over this store's records.
    pub fn create_computed_cache<T, F>(
        &mut self,
        name: impl Into<String>,
        compute: F,
    ) -> ComputedCache<T>
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn(&mut RecordCtx<'_, '_>, &Record) -> T + Send + Sync + 'static,
    {
        ComputedCache::new(self, name, compute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{sample_page, sample_shape};
    use crate::record::{RecordProps, RecordType};
    use crate::schema::StoreSchema;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn shape_x_cache(
        store: &mut Store,
        calls: Arc<AtomicUsize>,
    ) -> ComputedCache<f64> {
        ComputedCache::new(store, "shape-x", move |_, record| {
            calls.fetch_add(1, Ordering::SeqCst);
            match &record.props {
                RecordProps::Shape(p) => p.x,
                _ => 0.0,
            }
        })
    }

    fn put_shapes(store: &mut Store) {
        store
            .transact(|txn| {
                txn.put(sample_page());
                txn.put(sample_shape("s1"));
                txn.put(sample_shape("s2"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_lazy_creation_and_memoization() {
        let mut store = Store::new(StoreSchema::canvas());
        put_shapes(&mut store);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = shape_x_cache(&mut store, calls.clone());

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let id = RecordId::new(RecordType::Shape, "s1");
        assert_eq!(cache.get(&mut store, &id).unwrap().unwrap(), 10.0);
        assert_eq!(cache.get(&mut store, &id).unwrap().unwrap(), 10.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidated_only_by_own_record() {
        let mut store = Store::new(StoreSchema::canvas());
        put_shapes(&mut store);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = shape_x_cache(&mut store, calls.clone());

        let s1 = RecordId::new(RecordType::Shape, "s1");
        let s2 = RecordId::new(RecordType::Shape, "s2");
        let _ = cache.get(&mut store, &s1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Mutating an unrelated record must not re-invoke s1's entry.
        store
            .transact(|txn| {
                let mut moved = txn.get(&s2).unwrap();
                if let RecordProps::Shape(p) = &mut moved.props {
                    p.x = 77.0;
                }
                txn.put(moved);
                Ok(())
            })
            .unwrap();
        assert_eq!(cache.get(&mut store, &s1).unwrap().unwrap(), 10.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store
            .transact(|txn| {
                let mut moved = txn.get(&s1).unwrap();
                if let RecordProps::Shape(p) = &mut moved.props {
                    p.x = 33.0;
                }
                txn.put(moved);
                Ok(())
            })
            .unwrap();
        assert_eq!(cache.get(&mut store, &s1).unwrap().unwrap(), 33.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cross_record_dependency() {
        let mut store = Store::new(StoreSchema::canvas());
        put_shapes(&mut store);
        let s1 = RecordId::new(RecordType::Shape, "s1");
        let s2 = RecordId::new(RecordType::Shape, "s2");

        // Sum of this record's x and s2's x: reading s2 through the ctx
        // makes it a dependency.
        let other = s2.clone();
        let mut cache = ComputedCache::new(&mut store, "x-sum", move |ctx, record| {
            let own = match &record.props {
                RecordProps::Shape(p) => p.x,
                _ => 0.0,
            };
            let other = ctx
                .record(&other)
                .and_then(|r| match &r.props {
                    RecordProps::Shape(p) => Some(p.x),
                    _ => None,
                })
                .unwrap_or(0.0);
            own + other
        });

        assert_eq!(cache.get(&mut store, &s1).unwrap().unwrap(), 20.0);

        store
            .transact(|txn| {
                let mut moved = txn.get(&s2).unwrap();
                if let RecordProps::Shape(p) = &mut moved.props {
                    p.x = 100.0;
                }
                txn.put(moved);
                Ok(())
            })
            .unwrap();
        assert_eq!(cache.get(&mut store, &s1).unwrap().unwrap(), 110.0);
    }

    #[test]
    fn test_deleted_record_evicts_entry() {
        let mut store = Store::new(StoreSchema::canvas());
        put_shapes(&mut store);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = shape_x_cache(&mut store, calls.clone());

        let s1 = RecordId::new(RecordType::Shape, "s1");
        let _ = cache.get(&mut store, &s1);
        assert_eq!(cache.len(), 1);
        let live_before = store.graph().stats().deriveds;

        store
            .transact(|txn| {
                txn.delete(&s1);
                Ok(())
            })
            .unwrap();

        // The derived entry was released with the record, eagerly.
        assert_eq!(store.graph().stats().deriveds, live_before - 1);
        assert!(cache.get(&mut store, &s1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_unknown_id_is_none() {
        let mut store = Store::new(StoreSchema::canvas());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = shape_x_cache(&mut store, calls.clone());
        let missing = RecordId::new(RecordType::Shape, "nope");
        assert!(cache.get(&mut store, &missing).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
