//! # easel-store — Reactive, schema-validated record store for Easel
//!
//! The in-memory database under a collaborative canvas document: every
//! shape, binding, page, and presence entry is an immutable record snapshot
//! in a typed collection; every mutation flows through an atomic
//! transaction that validates, indexes, bumps the store epoch, and emits
//! exactly one structured diff.
//!
//! ## Architecture
//!
//! ```text
//! store.transact(|txn| { txn.put(..); txn.delete(..); Ok(()) })
//!        │
//!        ▼
//! validate drafts ──fail──► abort, zero observable effect
//!        │
//!        ▼
//! epoch += 1 ── RecordDiff ──► TransactionLog (durable records only)
//!        │                          │
//!        ▼                          ▼
//! record signals updated      range/compact for sync catch-up
//!        │
//!        ▼
//! computed caches invalidate ── listeners notified (batched)
//! ```
//!
//! ## Modules
//!
//! - [`record`] — canvas record model: typed ids, props sum type, validators
//! - [`schema`] — versioned collections, up/down JSON migrations
//! - [`store`] — transactions, queries, indexes, listeners
//! - [`cache`] — per-record computed values riding the signal graph
//! - [`geometry`] — world-space bounds, the canonical computed cache
//! - [`diff`] — added/updated/removed diffs between two epochs
//! - [`log`] — base snapshot + contiguous diff tail with compaction

pub mod cache;
pub mod diff;
pub mod geometry;
pub mod log;
pub mod record;
pub mod schema;
pub mod store;

pub use crate::cache::{ComputedCache, RecordCtx};
pub use crate::diff::{DiffError, RecordDiff};
pub use crate::geometry::{bounds_cache, Bounds};
pub use crate::log::{LogError, TransactionLog};
pub use crate::record::{
    BindingProps, DocumentProps, PageProps, PresenceProps, Record, RecordId, RecordProps,
    RecordType, SchemaViolation, ShapeKind, ShapeProps,
};
pub use crate::schema::{
    CollectionSchema, DownMigration, Migration, MigrationFailure, RawRecord, SchemaFingerprint,
    StoreSchema,
};
pub use crate::store::{ListenerToken, Predicate, RecordChange, Store, StoreError, Transaction};
