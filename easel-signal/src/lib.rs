//! # easel-signal — Fine-grained reactive signal graph for Easel
//!
//! The foundation of the Easel record store: source signals (mutable cells)
//! and derived signals (pure functions of other signals) with automatic
//! dependency tracking and lazy, memoized recomputation.
//!
//! ## Architecture
//!
//! ```text
//! graph.set(source, v)                 graph.read(derived)
//!       │                                     │
//!       ▼                                     ▼
//! epoch += 1                           freshen(derived)
//!       │                                     │
//!       ▼                              deps unchanged? ──yes──► cached value
//! mark dependents dirty                       │no
//!       │                                     ▼
//!       ▼                              recompute via SignalScope
//! queue listeners ──(batch end)──►     (reads register dependencies)
//! notify changed signals
//! ```
//!
//! ## Key properties
//!
//! - **Minimal recomputation** — a derived value is re-invoked only when a
//!   recorded dependency actually changed since the last computation.
//! - **Explicit tracking context** — dependency registration flows through a
//!   [`SignalScope`] passed to the computing closure, not hidden globals.
//!   One [`SignalGraph`] per document; independent documents never share
//!   reactive state.
//! - **Deferred notification** — listeners fire once per batch, after all
//!   writes, never in the middle of a transaction.
//! - **Cycle detection** — a derivation that reads itself fails with
//!   [`SignalError::CyclicDependency`] instead of looping.

mod graph;

pub use graph::{
    Derived, SignalError, SignalGraph, SignalHandle, SignalId, SignalScope, SignalStats, Source,
    Subscription,
};
