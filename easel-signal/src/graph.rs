//! The signal graph: slab-allocated reactive nodes with explicit tracking.
//!
//! Nodes live in generational slots so released handles can never observe a
//! recycled signal. Dependency edges are recorded per computation: while a
//! derivation runs, every tracked read appends to the top frame of the
//! graph's computation stack, and the frame becomes the derivation's
//! dependency set when it settles.
//!
//! Freshness rule: a derived value is valid iff none of its recorded
//! dependencies changed after the derivation's `last_computed` epoch. The
//! graph epoch advances once per effective source write and is the only
//! ordering mechanism — no wall clock anywhere.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Identity of a signal inside one [`SignalGraph`].
///
/// Generational: releasing a signal bumps the slot generation, so stale
/// handles read as absent instead of aliasing a new signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId {
    slot: u32,
    gen: u32,
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.gen)
    }
}

/// Handle to a source signal holding a value of type `T`.
pub struct Source<T> {
    id: SignalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Source<T> {
    pub fn id(&self) -> SignalId {
        self.id
    }
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Source<T> {}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Source({})", self.id)
    }
}

/// Handle to a derived signal computing a value of type `T`.
pub struct Derived<T> {
    id: SignalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Derived<T> {
    pub fn id(&self) -> SignalId {
        self.id
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Derived<T> {}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Derived({})", self.id)
    }
}

/// Typed access to a signal's id, implemented by both handle kinds.
pub trait SignalHandle<T> {
    fn signal_id(&self) -> SignalId;
}

impl<T> SignalHandle<T> for Source<T> {
    fn signal_id(&self) -> SignalId {
        self.id
    }
}

impl<T> SignalHandle<T> for Derived<T> {
    fn signal_id(&self) -> SignalId {
        self.id
    }
}

/// Signal graph errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// A derivation read itself, directly or transitively.
    CyclicDependency { signal: SignalId },
    /// The signal was released from the graph.
    Released { signal: SignalId },
    /// A user-supplied computation failed.
    Compute(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::CyclicDependency { signal } => {
                write!(f, "cyclic dependency detected at signal {signal}")
            }
            SignalError::Released { signal } => {
                write!(f, "signal {signal} was released")
            }
            SignalError::Compute(e) => write!(f, "derivation failed: {e}"),
        }
    }
}

impl std::error::Error for SignalError {}

/// Subscription token returned by [`SignalGraph::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    signal: SignalId,
    token: u64,
}

/// Graph-wide counters, snapshot via [`SignalGraph::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalStats {
    pub sources: usize,
    pub deriveds: usize,
    pub subscriptions: usize,
    pub epoch: u64,
}

type BoxedValue = Box<dyn Any + Send>;
type ComputeFn = Arc<dyn Fn(&mut SignalScope<'_>) -> Result<BoxedValue, SignalError> + Send + Sync>;
type ListenerFn = Box<dyn FnMut(&dyn Any) + Send>;
type EqFn = fn(&dyn Any, &dyn Any) -> bool;

fn eq_any<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

enum NodeKind {
    Source,
    Derived {
        compute: ComputeFn,
        /// Dependencies recorded during the last computation.
        deps: Vec<SignalId>,
        last_computed: u64,
        dirty: bool,
    },
}

struct Node {
    kind: NodeKind,
    value: Option<BoxedValue>,
    last_changed: u64,
    last_notified: u64,
    eq: EqFn,
    dependents: Vec<SignalId>,
    listeners: Vec<(u64, ListenerFn)>,
}

struct Slot {
    gen: u32,
    node: Option<Node>,
}

struct Frame {
    id: SignalId,
    deps: Vec<SignalId>,
}

/// A process-scoped reactive graph.
///
/// One graph per document. Dropping the graph releases every signal and
/// listener it owns; there is no hidden global state to tear down.
pub struct SignalGraph {
    epoch: u64,
    slots: Vec<Slot>,
    free: Vec<u32>,
    active: Vec<Frame>,
    pending: Vec<SignalId>,
    batch_depth: u32,
    next_token: u64,
}

impl Default for SignalGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGraph {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            slots: Vec::new(),
            free: Vec::new(),
            active: Vec::new(),
            pending: Vec::new(),
            batch_depth: 0,
            next_token: 0,
        }
    }

    /// Current graph epoch. Advances once per effective source write.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the signal is still live in this graph.
    pub fn contains(&self, id: SignalId) -> bool {
        self.node(id).is_some()
    }

    pub fn stats(&self) -> SignalStats {
        let mut stats = SignalStats {
            epoch: self.epoch,
            ..SignalStats::default()
        };
        for slot in &self.slots {
            if let Some(node) = &slot.node {
                match node.kind {
                    NodeKind::Source => stats.sources += 1,
                    NodeKind::Derived { .. } => stats.deriveds += 1,
                }
                stats.subscriptions += node.listeners.len();
            }
        }
        stats
    }

    /// Create a source signal holding `initial`.
    pub fn source<T>(&mut self, initial: T) -> Source<T>
    where
        T: PartialEq + Send + 'static,
    {
        let id = self.insert(Node {
            kind: NodeKind::Source,
            value: Some(Box::new(initial)),
            last_changed: self.epoch,
            last_notified: self.epoch,
            eq: eq_any::<T>,
            dependents: Vec::new(),
            listeners: Vec::new(),
        });
        Source {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a lazy derived signal. `compute` does not run until the first
    /// [`read`](Self::read).
    pub fn derived<T, F>(&mut self, compute: F) -> Derived<T>
    where
        T: PartialEq + Send + 'static,
        F: Fn(&mut SignalScope<'_>) -> Result<T, SignalError> + Send + Sync + 'static,
    {
        let compute: ComputeFn =
            Arc::new(move |scope| compute(scope).map(|v| Box::new(v) as BoxedValue));
        let id = self.insert(Node {
            kind: NodeKind::Derived {
                compute,
                deps: Vec::new(),
                last_computed: 0,
                dirty: true,
            },
            value: None,
            last_changed: 0,
            last_notified: 0,
            eq: eq_any::<T>,
            dependents: Vec::new(),
            listeners: Vec::new(),
        });
        Derived {
            id,
            _marker: PhantomData,
        }
    }

    /// Read a source signal. Registers a dependency when called from inside
    /// a derivation. Returns `None` if the signal was released.
    pub fn get<T>(&mut self, source: &Source<T>) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        self.record_dep(source.id);
        self.value_of(source.id)
    }

    /// Read a source signal without registering a dependency.
    pub fn peek<T>(&self, handle: &impl SignalHandle<T>) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        self.value_of(handle.signal_id())
    }

    /// Write a source signal. A value that compares equal to the current one
    /// is a no-op: no epoch bump, no invalidation, no notification.
    pub fn set<T>(&mut self, source: &Source<T>, value: T)
    where
        T: PartialEq + Send + 'static,
    {
        if !self.active.is_empty() {
            log::warn!("ignoring signal write issued during a derivation");
            return;
        }
        let id = source.id;
        let next_epoch = self.epoch + 1;
        let changed = match self.node_mut(id) {
            Some(node) => {
                let same = match &node.value {
                    Some(old) => (node.eq)(&**old, &value as &dyn Any),
                    None => false,
                };
                if same {
                    false
                } else {
                    node.value = Some(Box::new(value));
                    node.last_changed = next_epoch;
                    true
                }
            }
            None => {
                log::warn!("ignoring write to released signal {id}");
                return;
            }
        };
        if !changed {
            return;
        }
        self.epoch = next_epoch;
        self.queue_listeners(id);
        self.mark_dependents_dirty(id);
        if self.batch_depth == 0 {
            self.flush();
        }
    }

    /// Read a derived signal, recomputing it if any recorded dependency
    /// changed since the last computation.
    pub fn read<T>(&mut self, derived: &Derived<T>) -> Result<T, SignalError>
    where
        T: Clone + Send + 'static,
    {
        self.freshen(derived.id)?;
        self.record_dep(derived.id);
        self.value_of(derived.id)
            .ok_or(SignalError::Released { signal: derived.id })
    }

    /// Subscribe to change notifications. Listeners run batched, after the
    /// outermost [`batch`](Self::batch) (or immediately after an unbatched
    /// write), and only when the value actually changed.
    pub fn subscribe<T, F>(&mut self, signal: &impl SignalHandle<T>, mut listener: F) -> Subscription
    where
        T: 'static,
        F: FnMut(&T) + Send + 'static,
    {
        let id = signal.signal_id();
        let token = self.next_token;
        self.next_token += 1;
        match self.node_mut(id) {
            Some(node) => node.listeners.push((
                token,
                Box::new(move |value: &dyn Any| {
                    if let Some(v) = value.downcast_ref::<T>() {
                        listener(v);
                    }
                }),
            )),
            None => log::warn!("subscribe to released signal {id}"),
        }
        Subscription { signal: id, token }
    }

    pub fn unsubscribe(&mut self, sub: Subscription) {
        if let Some(node) = self.node_mut(sub.signal) {
            node.listeners.retain(|(token, _)| *token != sub.token);
        }
    }

    /// Run `f` with listener notification deferred to the end of the
    /// outermost batch.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let out = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.flush();
        }
        out
    }

    /// Release a signal and, eagerly, every signal that depends on it.
    pub fn release(&mut self, id: SignalId) {
        let node = match self.take_node(id) {
            Some(node) => node,
            None => return,
        };
        if let NodeKind::Derived { deps, .. } = &node.kind {
            for dep in deps {
                self.remove_dependent(*dep, id);
            }
        }
        self.pending.retain(|p| *p != id);
        for dependent in node.dependents {
            self.release(dependent);
        }
    }

    /// Deliver pending notifications now. Normally called automatically at
    /// the end of a write or batch.
    pub fn flush(&mut self) {
        let mut rounds = 0;
        while !self.pending.is_empty() {
            rounds += 1;
            if rounds > 64 {
                log::warn!("signal listener cascade exceeded 64 rounds; dropping remainder");
                self.pending.clear();
                break;
            }
            let pending = std::mem::take(&mut self.pending);
            for id in pending {
                self.notify(id);
            }
        }
    }

    // ── internals ──────────────────────────────────────────────────

    fn insert(&mut self, node: Node) -> SignalId {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.node = Some(node);
                SignalId {
                    slot,
                    gen: entry.gen,
                }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    node: Some(node),
                });
                SignalId { slot, gen: 0 }
            }
        }
    }

    fn node(&self, id: SignalId) -> Option<&Node> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: SignalId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.node.as_mut()
    }

    fn take_node(&mut self, id: SignalId) -> Option<Node> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let node = slot.node.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.slot);
        Some(node)
    }

    fn value_of<T: Clone + Send + 'static>(&self, id: SignalId) -> Option<T> {
        self.node(id)?
            .value
            .as_ref()
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    fn last_changed(&self, id: SignalId) -> Option<u64> {
        self.node(id).map(|node| node.last_changed)
    }

    fn record_dep(&mut self, id: SignalId) {
        if let Some(frame) = self.active.last_mut() {
            if !frame.deps.contains(&id) {
                frame.deps.push(id);
            }
        }
    }

    fn add_dependent(&mut self, dep: SignalId, dependent: SignalId) {
        if let Some(node) = self.node_mut(dep) {
            if !node.dependents.contains(&dependent) {
                node.dependents.push(dependent);
            }
        }
    }

    fn remove_dependent(&mut self, dep: SignalId, dependent: SignalId) {
        if let Some(node) = self.node_mut(dep) {
            node.dependents.retain(|d| *d != dependent);
        }
    }

    fn dependents_of(&self, id: SignalId) -> Vec<SignalId> {
        self.node(id)
            .map(|node| node.dependents.clone())
            .unwrap_or_default()
    }

    fn queue_listeners(&mut self, id: SignalId) {
        let has = self
            .node(id)
            .map(|node| !node.listeners.is_empty())
            .unwrap_or(false);
        if has && !self.pending.contains(&id) {
            self.pending.push(id);
        }
    }

    fn mark_dependents_dirty(&mut self, id: SignalId) {
        let mut stack = self.dependents_of(id);
        while let Some(d) = stack.pop() {
            self.queue_listeners(d);
            let newly_dirty = match self.node_mut(d) {
                Some(node) => match &mut node.kind {
                    NodeKind::Derived { dirty, .. } if !*dirty => {
                        *dirty = true;
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if newly_dirty {
                stack.extend(self.dependents_of(d));
            }
        }
    }

    /// Bring a derived node up to date. Recomputes only when a recorded
    /// dependency's `last_changed` moved past the node's `last_computed`.
    fn freshen(&mut self, id: SignalId) -> Result<(), SignalError> {
        let (dirty, never_computed, last_computed, deps) = match self.node(id) {
            Some(node) => match &node.kind {
                NodeKind::Source => return Ok(()),
                NodeKind::Derived {
                    dirty,
                    last_computed,
                    deps,
                    ..
                } => (*dirty, node.value.is_none(), *last_computed, deps.clone()),
            },
            None => return Err(SignalError::Released { signal: id }),
        };
        if !dirty && !never_computed {
            return Ok(());
        }

        let mut must_recompute = never_computed;
        if !must_recompute {
            for dep in &deps {
                match self.freshen(*dep) {
                    Ok(()) => match self.last_changed(*dep) {
                        Some(changed) if changed <= last_computed => {}
                        _ => {
                            must_recompute = true;
                            break;
                        }
                    },
                    // A released dependency forces a recompute; the new run
                    // decides what to do without it.
                    Err(SignalError::Released { .. }) => {
                        must_recompute = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if !must_recompute {
            if let Some(node) = self.node_mut(id) {
                if let NodeKind::Derived { dirty, .. } = &mut node.kind {
                    *dirty = false;
                }
            }
            return Ok(());
        }

        if self.active.iter().any(|frame| frame.id == id) {
            return Err(SignalError::CyclicDependency { signal: id });
        }
        let compute = match self.node(id) {
            Some(Node {
                kind: NodeKind::Derived { compute, .. },
                ..
            }) => compute.clone(),
            _ => return Err(SignalError::Released { signal: id }),
        };

        self.active.push(Frame {
            id,
            deps: Vec::new(),
        });
        let result = {
            let mut scope = SignalScope { graph: self };
            compute(&mut scope)
        };
        let frame = self.active.pop().unwrap_or(Frame {
            id,
            deps: Vec::new(),
        });
        // On failure the node stays dirty so the next read retries; no
        // poisoned value is cached.
        let value = result?;

        for dep in &deps {
            if !frame.deps.contains(dep) {
                self.remove_dependent(*dep, id);
            }
        }
        for dep in &frame.deps {
            if !deps.contains(dep) {
                self.add_dependent(*dep, id);
            }
        }

        let epoch = self.epoch;
        if let Some(node) = self.node_mut(id) {
            let changed = match &node.value {
                Some(old) => !(node.eq)(&**old, &*value),
                None => true,
            };
            node.value = Some(value);
            if changed {
                node.last_changed = epoch;
            }
            if let NodeKind::Derived {
                deps,
                dirty,
                last_computed,
                ..
            } = &mut node.kind
            {
                *deps = frame.deps;
                *dirty = false;
                *last_computed = epoch;
            }
        }
        Ok(())
    }

    fn notify(&mut self, id: SignalId) {
        let is_derived = match self.node(id) {
            Some(node) => matches!(node.kind, NodeKind::Derived { .. }),
            None => return,
        };
        if is_derived {
            if let Err(e) = self.freshen(id) {
                log::warn!("skipping listeners for failed derivation {id}: {e}");
                return;
            }
        }
        let mut listeners = match self.node_mut(id) {
            Some(node) => {
                if node.last_changed <= node.last_notified
                    || node.listeners.is_empty()
                    || node.value.is_none()
                {
                    return;
                }
                node.last_notified = node.last_changed;
                std::mem::take(&mut node.listeners)
            }
            None => return,
        };
        if let Some(value) = self.node(id).and_then(|node| node.value.as_deref()) {
            for (_, listener) in listeners.iter_mut() {
                listener(value);
            }
        }
        if let Some(node) = self.node_mut(id) {
            let added = std::mem::take(&mut node.listeners);
            listeners.extend(added);
            node.listeners = listeners;
        }
    }
}

/// The explicit "current computation" context handed to derivation closures.
///
/// Reads made through the scope register dependencies on the executing
/// derivation; that set determines when the derivation recomputes.
pub struct SignalScope<'g> {
    graph: &'g mut SignalGraph,
}

impl SignalScope<'_> {
    /// Tracked read of a source signal. `None` if it was released.
    pub fn get<T>(&mut self, source: &Source<T>) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        self.graph.get(source)
    }

    /// Tracked read of another derived signal.
    pub fn read<T>(&mut self, derived: &Derived<T>) -> Result<T, SignalError>
    where
        T: Clone + Send + 'static,
    {
        self.graph.read(derived)
    }

    /// Untracked read.
    pub fn peek<T>(&self, handle: &impl SignalHandle<T>) -> Option<T>
    where
        T: Clone + Send + 'static,
    {
        self.graph.peek(handle)
    }

    pub fn epoch(&self) -> u64 {
        self.graph.epoch()
    }
}
