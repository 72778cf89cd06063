//! Directed coupling model.
//!
//! A `Graph` owns a set of atomic models and the coupling relation that
//! routes outputs to inputs: values produced on a pin flow along
//! pin→pin edges and terminate at pin→atomic edges. Routing is the
//! transitive closure over those edges.
//!
//! The wiring tables live in a separate [`Coupling`] so the parallel
//! engines can share them immutably across worker threads while the
//! atomics themselves are distributed to logical processes.
//!
//! While a simulator is running, the graph sits in *provisional* mode:
//! every structural mutation is queued instead of applied, and the
//! engine drains the queue in FIFO order between state-transition
//! phases — never mid-routing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{KairosError, KairosResult};
use crate::model::{Atomic, AtomicId, Pin};

/// A queued structural mutation.
enum GraphOp<X> {
    AddAtomic {
        id: AtomicId,
        model: Box<dyn Atomic<X>>,
    },
    RemoveAtomic(AtomicId),
    RemovePin(Pin),
    ConnectPins(Pin, Pin),
    DisconnectPins(Pin, Pin),
    ConnectAtomic(Pin, AtomicId),
    DisconnectAtomic(Pin, AtomicId),
}

/// A structural change reported by [`Graph::apply_pending`] so the
/// engine can adjust its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureChange {
    /// A new atomic joined the graph and must be scheduled.
    AtomicAdded(AtomicId),
    /// An atomic left the graph and must be descheduled.
    AtomicRemoved(AtomicId),
    /// A pin was removed along with its edges.
    PinRemoved(Pin),
    /// Pin wiring changed without affecting membership.
    CouplingChanged,
}

/// The pin-wiring half of a graph: plain tables, shareable across
/// threads while a parallel engine routes through them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Coupling {
    pins: BTreeSet<Pin>,
    next_pin: u64,
    pin_edges: BTreeMap<Pin, Vec<Pin>>,
    pin_sinks: BTreeMap<Pin, Vec<AtomicId>>,
}

impl Coupling {
    fn add_pin(&mut self) -> Pin {
        let pin = Pin::new(self.next_pin);
        self.next_pin += 1;
        self.pins.insert(pin);
        pin
    }

    fn remove_pin(&mut self, pin: Pin) -> KairosResult<()> {
        if !self.pins.remove(&pin) {
            return Err(KairosError::UnknownPin(pin));
        }
        self.pin_edges.remove(&pin);
        self.pin_sinks.remove(&pin);
        for edges in self.pin_edges.values_mut() {
            edges.retain(|&p| p != pin);
        }
        Ok(())
    }

    fn connect_pins(&mut self, from: Pin, to: Pin) -> KairosResult<()> {
        self.check_pin(from)?;
        self.check_pin(to)?;
        self.pin_edges.entry(from).or_default().push(to);
        Ok(())
    }

    fn disconnect_pins(&mut self, from: Pin, to: Pin) -> KairosResult<()> {
        self.check_pin(from)?;
        let edges = self.pin_edges.entry(from).or_default();
        if let Some(pos) = edges.iter().position(|&p| p == to) {
            edges.remove(pos);
        }
        Ok(())
    }

    fn connect_atomic(&mut self, pin: Pin, target: AtomicId) -> KairosResult<()> {
        self.check_pin(pin)?;
        self.pin_sinks.entry(pin).or_default().push(target);
        Ok(())
    }

    fn disconnect_atomic(&mut self, pin: Pin, target: AtomicId) -> KairosResult<()> {
        self.check_pin(pin)?;
        let sinks = self.pin_sinks.entry(pin).or_default();
        if let Some(pos) = sinks.iter().position(|&t| t == target) {
            sinks.remove(pos);
        }
        Ok(())
    }

    fn remove_atomic_sinks(&mut self, id: AtomicId) {
        for sinks in self.pin_sinks.values_mut() {
            sinks.retain(|&t| t != id);
        }
    }

    /// Resolve every `(terminal pin, receiving atomic)` pair reachable
    /// from `pin` by transitive closure over pin→pin edges. Cycles in
    /// the pin wiring are tolerated; each pin is visited once.
    pub(crate) fn route(&self, pin: Pin) -> KairosResult<Vec<(Pin, AtomicId)>> {
        self.check_pin(pin)?;
        let mut receivers = Vec::new();
        let mut visited = BTreeSet::new();
        let mut frontier = vec![pin];
        while let Some(p) = frontier.pop() {
            if !visited.insert(p) {
                continue;
            }
            if let Some(sinks) = self.pin_sinks.get(&p) {
                for &target in sinks {
                    receivers.push((p, target));
                }
            }
            if let Some(next) = self.pin_edges.get(&p) {
                frontier.extend(next.iter().copied());
            }
        }
        Ok(receivers)
    }

    fn check_pin(&self, pin: Pin) -> KairosResult<()> {
        if self.pins.contains(&pin) {
            Ok(())
        } else {
            Err(KairosError::UnknownPin(pin))
        }
    }
}

/// The coupling model consumed by every engine.
pub struct Graph<X> {
    /// Slab of owned atomics; `AtomicId` is the slab index. Slots are
    /// never reused, so ids stay unique for the graph's lifetime.
    atomics: Vec<Option<Box<dyn Atomic<X>>>>,
    /// Ids that are minted and not (yet) removed.
    registered: BTreeSet<AtomicId>,
    coupling: Coupling,
    provisional: bool,
    pending: VecDeque<GraphOp<X>>,
}

impl<X> Default for Graph<X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X> Graph<X> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Graph {
            atomics: Vec::new(),
            registered: BTreeSet::new(),
            coupling: Coupling::default(),
            provisional: false,
            pending: VecDeque::new(),
        }
    }

    // ── Membership ────────────────────────────────────────────────

    /// Register an atomic. The returned id is valid immediately, but in
    /// provisional mode the model itself joins the graph only when the
    /// pending queue is drained.
    pub fn add_atomic(&mut self, model: Box<dyn Atomic<X>>) -> AtomicId {
        let id = AtomicId::new(self.atomics.len() as u64);
        self.atomics.push(None);
        self.registered.insert(id);
        if self.provisional {
            self.pending.push_back(GraphOp::AddAtomic { id, model });
        } else {
            self.atomics[id.index()] = Some(model);
        }
        id
    }

    /// Remove an atomic and every pin→atomic edge pointing at it.
    pub fn remove_atomic(&mut self, id: AtomicId) -> KairosResult<()> {
        if !self.registered.contains(&id) {
            return Err(KairosError::UnknownAtomic(id));
        }
        if self.provisional {
            self.pending.push_back(GraphOp::RemoveAtomic(id));
            Ok(())
        } else {
            self.apply_remove_atomic(id)
        }
    }

    /// Mint a new pin. Pins have no structural hazard, so minting
    /// applies immediately even in provisional mode.
    pub fn add_pin(&mut self) -> Pin {
        self.coupling.add_pin()
    }

    /// Remove a pin and every edge into or out of it.
    pub fn remove_pin(&mut self, pin: Pin) -> KairosResult<()> {
        self.coupling.check_pin(pin)?;
        if self.provisional {
            self.pending.push_back(GraphOp::RemovePin(pin));
            Ok(())
        } else {
            self.coupling.remove_pin(pin)
        }
    }

    // ── Coupling ──────────────────────────────────────────────────

    /// Couple `from` to `to`: values produced on `from` flow onward to
    /// `to`.
    pub fn connect(&mut self, from: Pin, to: Pin) -> KairosResult<()> {
        self.coupling.check_pin(from)?;
        self.coupling.check_pin(to)?;
        if self.provisional {
            self.pending.push_back(GraphOp::ConnectPins(from, to));
            Ok(())
        } else {
            self.coupling.connect_pins(from, to)
        }
    }

    /// Remove a pin→pin edge.
    pub fn disconnect(&mut self, from: Pin, to: Pin) -> KairosResult<()> {
        self.coupling.check_pin(from)?;
        self.coupling.check_pin(to)?;
        if self.provisional {
            self.pending.push_back(GraphOp::DisconnectPins(from, to));
            Ok(())
        } else {
            self.coupling.disconnect_pins(from, to)
        }
    }

    /// Couple `pin` to an atomic: values reaching `pin` are delivered to
    /// `target` as input.
    pub fn connect_to_atomic(&mut self, pin: Pin, target: AtomicId) -> KairosResult<()> {
        self.coupling.check_pin(pin)?;
        self.check_atomic(target)?;
        if self.provisional {
            self.pending.push_back(GraphOp::ConnectAtomic(pin, target));
            Ok(())
        } else {
            self.coupling.connect_atomic(pin, target)
        }
    }

    /// Remove a pin→atomic edge.
    pub fn disconnect_from_atomic(&mut self, pin: Pin, target: AtomicId) -> KairosResult<()> {
        self.coupling.check_pin(pin)?;
        self.check_atomic(target)?;
        if self.provisional {
            self.pending.push_back(GraphOp::DisconnectAtomic(pin, target));
            Ok(())
        } else {
            self.coupling.disconnect_atomic(pin, target)
        }
    }

    // ── Routing ───────────────────────────────────────────────────

    /// Resolve every `(terminal pin, receiving atomic)` pair reachable
    /// from `pin`. See [`Coupling::route`].
    pub fn route(&self, pin: Pin) -> KairosResult<Vec<(Pin, AtomicId)>> {
        self.coupling.route(pin)
    }

    /// The shareable wiring tables.
    pub(crate) fn coupling(&self) -> &Coupling {
        &self.coupling
    }

    // ── Provisional mode ──────────────────────────────────────────

    /// Returns `true` while structural mutations are being buffered.
    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    pub(crate) fn set_provisional(&mut self, provisional: bool) {
        self.provisional = provisional;
    }

    /// Drain the pending mutation queue in FIFO order.
    ///
    /// Only called with provisional mode off, so drained operations
    /// apply directly.
    pub(crate) fn apply_pending(&mut self) -> KairosResult<Vec<StructureChange>> {
        let mut changes = Vec::new();
        while let Some(op) = self.pending.pop_front() {
            match op {
                GraphOp::AddAtomic { id, model } => {
                    self.atomics[id.index()] = Some(model);
                    changes.push(StructureChange::AtomicAdded(id));
                }
                GraphOp::RemoveAtomic(id) => {
                    self.apply_remove_atomic(id)?;
                    changes.push(StructureChange::AtomicRemoved(id));
                }
                GraphOp::RemovePin(pin) => {
                    self.coupling.remove_pin(pin)?;
                    changes.push(StructureChange::PinRemoved(pin));
                }
                GraphOp::ConnectPins(a, b) => {
                    self.coupling.connect_pins(a, b)?;
                    changes.push(StructureChange::CouplingChanged);
                }
                GraphOp::DisconnectPins(a, b) => {
                    self.coupling.disconnect_pins(a, b)?;
                    changes.push(StructureChange::CouplingChanged);
                }
                GraphOp::ConnectAtomic(pin, id) => {
                    self.check_atomic(id)?;
                    self.coupling.connect_atomic(pin, id)?;
                    changes.push(StructureChange::CouplingChanged);
                }
                GraphOp::DisconnectAtomic(pin, id) => {
                    self.coupling.disconnect_atomic(pin, id)?;
                    changes.push(StructureChange::CouplingChanged);
                }
            }
        }
        if !changes.is_empty() {
            log::debug!("applied {} provisional structure changes", changes.len());
        }
        Ok(changes)
    }

    // ── Accessors ─────────────────────────────────────────────────

    /// Ids of all registered atomics, in ascending order.
    pub fn atomic_ids(&self) -> Vec<AtomicId> {
        self.registered.iter().copied().collect()
    }

    /// Number of registered atomics.
    pub fn atomic_count(&self) -> usize {
        self.registered.len()
    }

    /// Total slab slots minted so far (engine record sizing).
    pub(crate) fn slot_count(&self) -> usize {
        self.atomics.len()
    }

    /// Immutable access to an atomic.
    pub fn atomic(&self, id: AtomicId) -> Option<&dyn Atomic<X>> {
        self.atomics.get(id.index())?.as_deref()
    }

    /// Mutable access to an atomic.
    pub fn atomic_mut(&mut self, id: AtomicId) -> Option<&mut Box<dyn Atomic<X>>> {
        self.atomics.get(id.index())?;
        self.atomics[id.index()].as_mut()
    }

    /// Move an atomic out of the slab. The id stays registered so the
    /// coupling keeps resolving to it; the caller owns the model until
    /// it is put back.
    pub(crate) fn take_atomic(&mut self, id: AtomicId) -> Option<Box<dyn Atomic<X>>> {
        self.atomics.get_mut(id.index())?.take()
    }

    /// Return an atomic previously moved out with `take_atomic`.
    pub(crate) fn put_atomic(&mut self, id: AtomicId, model: Box<dyn Atomic<X>>) {
        self.atomics[id.index()] = Some(model);
    }

    fn apply_remove_atomic(&mut self, id: AtomicId) -> KairosResult<()> {
        if !self.registered.remove(&id) {
            return Err(KairosError::UnknownAtomic(id));
        }
        self.atomics[id.index()] = None;
        self.coupling.remove_atomic_sinks(id);
        Ok(())
    }

    fn check_atomic(&self, id: AtomicId) -> KairosResult<()> {
        if self.registered.contains(&id) {
            Ok(())
        } else {
            Err(KairosError::UnknownAtomic(id))
        }
    }
}

impl<X> std::fmt::Debug for Graph<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("atomics", &self.registered.len())
            .field("provisional", &self.provisional)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PinValue;

    /// A model that never does anything; membership tests only need ids.
    struct Inert;

    impl Atomic<u32> for Inert {
        fn ta(&self) -> f64 {
            f64::INFINITY
        }
        fn delta_int(&mut self) {}
        fn delta_ext(&mut self, _e: f64, _inputs: &[PinValue<u32>]) {}
        fn delta_conf(&mut self, _inputs: &[PinValue<u32>]) {}
        fn output_func(&mut self, _outputs: &mut Vec<PinValue<u32>>) {}
    }

    #[test]
    fn test_route_direct() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p = g.add_pin();
        g.connect_to_atomic(p, a).unwrap();

        let receivers = g.route(p).unwrap();
        assert_eq!(receivers, vec![(p, a)]);
    }

    #[test]
    fn test_route_transitive() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let b = g.add_atomic(Box::new(Inert));
        let p0 = g.add_pin();
        let p1 = g.add_pin();
        let p2 = g.add_pin();
        g.connect(p0, p1).unwrap();
        g.connect(p1, p2).unwrap();
        g.connect_to_atomic(p1, a).unwrap();
        g.connect_to_atomic(p2, b).unwrap();

        let mut receivers = g.route(p0).unwrap();
        receivers.sort();
        assert_eq!(receivers, vec![(p1, a), (p2, b)]);
    }

    #[test]
    fn test_route_tolerates_pin_cycles() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p0 = g.add_pin();
        let p1 = g.add_pin();
        g.connect(p0, p1).unwrap();
        g.connect(p1, p0).unwrap();
        g.connect_to_atomic(p1, a).unwrap();

        let receivers = g.route(p0).unwrap();
        assert_eq!(receivers, vec![(p1, a)]);
    }

    #[test]
    fn test_unknown_pin_rejected() {
        let mut g: Graph<u32> = Graph::new();
        let ghost = Pin::new(99);
        assert_eq!(g.remove_pin(ghost), Err(KairosError::UnknownPin(ghost)));
        assert_eq!(g.route(ghost).unwrap_err(), KairosError::UnknownPin(ghost));
    }

    #[test]
    fn test_unknown_atomic_rejected() {
        let mut g: Graph<u32> = Graph::new();
        let p = g.add_pin();
        let ghost = AtomicId::new(42);
        assert_eq!(
            g.connect_to_atomic(p, ghost),
            Err(KairosError::UnknownAtomic(ghost))
        );
    }

    #[test]
    fn test_provisional_buffers_until_drain() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p = g.add_pin();
        g.connect_to_atomic(p, a).unwrap();

        g.set_provisional(true);
        let b = g.add_atomic(Box::new(Inert));
        g.connect_to_atomic(p, b).unwrap();

        // Nothing applied yet: the route still sees only `a`.
        assert_eq!(g.route(p).unwrap(), vec![(p, a)]);

        g.set_provisional(false);
        let changes = g.apply_pending().unwrap();
        assert!(changes.contains(&StructureChange::AtomicAdded(b)));

        let mut receivers = g.route(p).unwrap();
        receivers.sort();
        assert_eq!(receivers, vec![(p, a), (p, b)]);
    }

    #[test]
    fn test_pending_drained_fifo() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p = g.add_pin();

        g.set_provisional(true);
        g.connect_to_atomic(p, a).unwrap();
        g.disconnect_from_atomic(p, a).unwrap();
        g.set_provisional(false);
        g.apply_pending().unwrap();

        // Connect then disconnect in FIFO order nets out to nothing.
        assert!(g.route(p).unwrap().is_empty());
    }

    #[test]
    fn test_remove_atomic_scrubs_sinks() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p = g.add_pin();
        g.connect_to_atomic(p, a).unwrap();
        g.remove_atomic(a).unwrap();

        assert!(g.route(p).unwrap().is_empty());
        assert!(g.atomic(a).is_none());
    }

    #[test]
    fn test_remove_pin_scrubs_edges() {
        let mut g: Graph<u32> = Graph::new();
        let a = g.add_atomic(Box::new(Inert));
        let p0 = g.add_pin();
        let p1 = g.add_pin();
        g.connect(p0, p1).unwrap();
        g.connect_to_atomic(p1, a).unwrap();

        g.remove_pin(p1).unwrap();
        assert!(g.route(p0).unwrap().is_empty());
    }
}
