//! Sequential DEVS executive.
//!
//! Drives a [`Graph`] of atomic models through macro-steps at the
//! scheduler's minimum next-event time. Each macro-step has two phases:
//! `compute_next_output` produces and routes outputs (Moore models
//! first, then Mealy models whose output may depend on those), and
//! `compute_next_state` applies the internal/confluent/external
//! transition trichotomy, reschedules, and drains provisional structure
//! changes.
//!
//! The split between the two phases is what makes the simulator usable
//! as a federate: a caller can compute outputs, learn that an external
//! authority has input for an earlier time, call `set_next_time` and
//! `inject_input`, and only then commit state.

use std::collections::BTreeSet;

use crate::error::{KairosError, KairosResult};
use crate::graph::{Graph, StructureChange};
use crate::listener::{EventListener, ListenerSet};
use crate::model::{Atomic, AtomicId, PinValue};
use crate::scheduler::Scheduler;
use crate::time::SuperDenseTime;

/// Engine-owned bookkeeping for one atomic.
///
/// The event clock (`t_last`, `t_next`) lives here rather than on the
/// model so the engine alone decides when it moves.
struct AtomicRecord<X> {
    t_last: SuperDenseTime,
    t_next: SuperDenseTime,
    mealy: bool,
    inputs: Vec<PinValue<X>>,
    outputs: Vec<PinValue<X>>,
}

impl<X> Default for AtomicRecord<X> {
    fn default() -> Self {
        AtomicRecord {
            t_last: SuperDenseTime::ZERO,
            t_next: SuperDenseTime::INFINITY,
            mealy: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Single-threaded priority-queue-driven DEVS executive.
pub struct Simulator<X> {
    graph: Graph<X>,
    records: Vec<AtomicRecord<X>>,
    sched: Scheduler,
    /// Models whose output has been computed this macro-step. A Mealy
    /// model in this set must not receive further input; that is the
    /// feedback-loop error.
    active: BTreeSet<AtomicId>,
    listeners: ListenerSet<X>,
    injected: Vec<PinValue<X>>,
    t_next: SuperDenseTime,
}

impl<X: Clone> Simulator<X> {
    /// Create a simulator for a coupled model.
    ///
    /// Every atomic is scheduled at its initial next-event time; a
    /// negative time advance fails construction. The graph is switched
    /// into provisional mode for the lifetime of the simulator.
    pub fn new(mut graph: Graph<X>) -> KairosResult<Self> {
        let mut records: Vec<AtomicRecord<X>> = Vec::new();
        records.resize_with(graph.slot_count(), AtomicRecord::default);
        let mut sched = Scheduler::new();
        for id in graph.atomic_ids() {
            records[id.index()].mealy = graph.atomic(id).map(|m| m.is_mealy()).unwrap_or(false);
            Self::schedule_atomic(&mut sched, &mut records, &graph, id, SuperDenseTime::ZERO)?;
        }
        graph.set_provisional(true);
        let t_next = sched.min_priority();
        Ok(Simulator {
            graph,
            records,
            sched,
            active: BTreeSet::new(),
            listeners: ListenerSet::new(),
            injected: Vec::new(),
            t_next,
        })
    }

    /// Create a simulator for a single atomic model.
    pub fn from_atomic(model: Box<dyn Atomic<X>>) -> KairosResult<Self> {
        let mut graph = Graph::new();
        graph.add_atomic(model);
        Self::new(graph)
    }

    /// The absolute time of the next output and change of state.
    pub fn next_event_time(&self) -> SuperDenseTime {
        self.t_next
    }

    /// Access the coupled model. Structural mutations made through the
    /// returned reference are buffered and applied after the next
    /// `compute_next_state`.
    pub fn graph_mut(&mut self) -> &mut Graph<X> {
        &mut self.graph
    }

    /// Immutable access to the coupled model.
    pub fn graph(&self) -> &Graph<X> {
        &self.graph
    }

    /// Register an event listener. Listeners are notified in
    /// registration order.
    pub fn add_event_listener(&mut self, listener: Box<dyn EventListener<X>>) {
        self.listeners.register(listener);
    }

    /// Inject an input to be applied at the next `compute_next_output`.
    /// The value is routed from its pin to every reachable receiver.
    pub fn inject_input(&mut self, x: PinValue<X>) {
        self.injected.push(x);
    }

    /// Erase injected inputs that have not yet been consumed.
    pub fn clear_injected_input(&mut self) {
        self.injected.clear();
    }

    /// Force the next event to occur at `t`, earlier than the scheduler
    /// would have chosen. Used when an external authority demands that
    /// injected input be applied at a specific time.
    pub fn set_next_time(&mut self, t: SuperDenseTime) {
        self.t_next = t;
    }

    /// Execute one full simulation cycle at the next event time.
    pub fn exec_next_event(&mut self) -> KairosResult<SuperDenseTime> {
        self.compute_next_output()?;
        self.compute_next_state()
    }

    /// Compute and route the outputs of models active at the next event
    /// time: imminent Moore models first, then Mealy models (whose
    /// output may depend on the Moore outputs), plus any model reached
    /// by injected input. Does not change model states or the clock.
    pub fn compute_next_output(&mut self) -> KairosResult<()> {
        let t_next = self.t_next;
        // Undo any prior output calculation at this time.
        for id in &self.active {
            let rec = &mut self.records[id.index()];
            rec.inputs.clear();
            rec.outputs.clear();
        }
        self.active.clear();
        let mut pending: BTreeSet<AtomicId> = BTreeSet::new();

        // Route externally supplied inputs.
        let injected = std::mem::take(&mut self.injected);
        for pv in injected {
            for (pin, target) in self.graph.route(pv.pin)? {
                let rec = &mut self.records[target.index()];
                rec.inputs.push(PinValue::new(pin, pv.value.clone()));
                if rec.mealy {
                    pending.insert(target);
                } else {
                    self.active.insert(target);
                }
            }
        }

        // Route the output of the imminent Moore models.
        if self.sched.min_priority() == t_next {
            for id in self.sched.visit_imminent() {
                if self.records[id.index()].mealy {
                    // Mealy outputs wait until every Moore output is routed.
                    pending.insert(id);
                    continue;
                }
                self.active.insert(id);
                let mut outputs = Vec::new();
                let model = self
                    .graph
                    .atomic_mut(id)
                    .ok_or(KairosError::UnknownAtomic(id))?;
                model.output_func(&mut outputs);
                self.route_outputs(id, &outputs, false, &mut pending)?;
                self.records[id.index()].outputs = outputs;
            }
        }

        // Compute output from the Mealy models.
        while let Some(id) = pending.pop_first() {
            // Entering the active set marks "output computed": input
            // arriving after this point is a feedback loop.
            self.active.insert(id);
            let rec = &self.records[id.index()];
            let imminent = rec.t_next == t_next;
            let e = t_next.elapsed_since(rec.t_last);
            let inputs = std::mem::take(&mut self.records[id.index()].inputs);
            let mut outputs = Vec::new();
            {
                let model = self
                    .graph
                    .atomic_mut(id)
                    .ok_or(KairosError::UnknownAtomic(id))?;
                let mealy = model
                    .as_mealy()
                    .expect("model reported is_mealy() but as_mealy() returned None");
                if inputs.is_empty() && imminent {
                    mealy.output_func(&mut outputs);
                } else if imminent {
                    mealy.confluent_output_func(&inputs, &mut outputs);
                } else {
                    mealy.external_output_func(e, &inputs, &mut outputs);
                }
            }
            self.records[id.index()].inputs = inputs;
            self.route_outputs(id, &outputs, true, &mut pending)?;
            self.records[id.index()].outputs = outputs;
        }
        Ok(())
    }

    /// Apply state transitions to every active model, notify listeners,
    /// reschedule, and drain provisional structure changes.
    ///
    /// Returns the simulation time after the step (the event time
    /// advanced by the super-dense epsilon).
    pub fn compute_next_state(&mut self) -> KairosResult<SuperDenseTime> {
        let t_next = self.t_next;
        let t = t_next + SuperDenseTime::EPSILON;
        let active = std::mem::take(&mut self.active);
        for id in active {
            let inputs = std::mem::take(&mut self.records[id.index()].inputs);
            for x in &inputs {
                self.listeners.notify_input(id, x, t_next);
            }
            let imminent = self.records[id.index()].t_next == t_next;
            let e = t_next.elapsed_since(self.records[id.index()].t_last);
            {
                let model = self
                    .graph
                    .atomic_mut(id)
                    .ok_or(KairosError::UnknownAtomic(id))?;
                if inputs.is_empty() {
                    model.delta_int();
                } else if imminent {
                    model.delta_conf(&inputs);
                } else {
                    model.delta_ext(e, &inputs);
                }
            }
            self.listeners.notify_state_change(id, t_next);
            self.records[id.index()].outputs.clear();
            Self::schedule_atomic(&mut self.sched, &mut self.records, &self.graph, id, t)?;
        }

        // Effect any changes in the model structure.
        self.graph.set_provisional(false);
        let changes = self.graph.apply_pending()?;
        for change in changes {
            match change {
                StructureChange::AtomicAdded(id) => {
                    if self.records.len() < self.graph.slot_count() {
                        self.records
                            .resize_with(self.graph.slot_count(), AtomicRecord::default);
                    }
                    self.records[id.index()].mealy =
                        self.graph.atomic(id).map(|m| m.is_mealy()).unwrap_or(false);
                    Self::schedule_atomic(&mut self.sched, &mut self.records, &self.graph, id, t)?;
                }
                StructureChange::AtomicRemoved(id) => {
                    self.sched.schedule(id, SuperDenseTime::INFINITY);
                    self.records[id.index()] = AtomicRecord::default();
                }
                StructureChange::PinRemoved(_) | StructureChange::CouplingChanged => {}
            }
        }
        self.graph.set_provisional(true);

        self.t_next = self.sched.min_priority();
        Ok(t)
    }

    /// Route `outputs` of `src` to their receivers, notifying listeners
    /// and bucketing receivers into the active (Moore) or pending
    /// (Mealy) set. With `check_feedback`, delivering to a Mealy model
    /// whose output is already computed is the illegal feedback loop.
    fn route_outputs(
        &mut self,
        src: AtomicId,
        outputs: &[PinValue<X>],
        check_feedback: bool,
        pending: &mut BTreeSet<AtomicId>,
    ) -> KairosResult<()> {
        for y in outputs {
            self.listeners.notify_output(src, y, self.t_next);
            for (pin, target) in self.graph.route(y.pin)? {
                if target == src {
                    return Err(KairosError::SelfInfluence { atomic: src, pin });
                }
                let rec = &mut self.records[target.index()];
                rec.inputs.push(PinValue::new(pin, y.value.clone()));
                if rec.mealy {
                    if check_feedback && self.active.contains(&target) {
                        return Err(KairosError::MealyFeedbackLoop { atomic: target });
                    }
                    pending.insert(target);
                } else {
                    self.active.insert(target);
                }
            }
        }
        Ok(())
    }

    /// Record the event clock for `id` after an event at `t` and put it
    /// back in the schedule: `t_last = t`, `t_next = t + (ta, 0)`.
    fn schedule_atomic(
        sched: &mut Scheduler,
        records: &mut [AtomicRecord<X>],
        graph: &Graph<X>,
        id: AtomicId,
        t: SuperDenseTime,
    ) -> KairosResult<()> {
        let model = graph.atomic(id).ok_or(KairosError::UnknownAtomic(id))?;
        let dt = model.ta();
        let rec = &mut records[id.index()];
        rec.t_last = t;
        if dt == f64::INFINITY {
            rec.t_next = SuperDenseTime::INFINITY;
            sched.schedule(id, SuperDenseTime::INFINITY);
        } else {
            if dt < 0.0 {
                return Err(KairosError::NegativeTimeAdvance { atomic: id, dt });
            }
            rec.t_next = t + SuperDenseTime::real(dt);
            sched.schedule(id, rec.t_next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Pin;
    use std::sync::{Arc, Mutex};

    /// Emits `42` on its pin every tick.
    struct Generator {
        out: Pin,
        period: f64,
        fired: u32,
    }

    impl Atomic<i64> for Generator {
        fn ta(&self) -> f64 {
            self.period
        }
        fn delta_int(&mut self) {
            self.fired += 1;
        }
        fn delta_ext(&mut self, _e: f64, _inputs: &[PinValue<i64>]) {}
        fn delta_conf(&mut self, _inputs: &[PinValue<i64>]) {}
        fn output_func(&mut self, outputs: &mut Vec<PinValue<i64>>) {
            outputs.push(PinValue::new(self.out, 42));
        }
    }

    /// Remembers every input it receives, with the transition kind.
    #[derive(Default, Clone)]
    struct Sink {
        received: Arc<Mutex<Vec<(f64, i64, &'static str)>>>,
        elapsed: Arc<Mutex<Vec<f64>>>,
        clock: f64,
    }

    impl Atomic<i64> for Sink {
        fn ta(&self) -> f64 {
            f64::INFINITY
        }
        fn delta_int(&mut self) {}
        fn delta_ext(&mut self, e: f64, inputs: &[PinValue<i64>]) {
            self.clock += e;
            self.elapsed.lock().unwrap().push(e);
            for x in inputs {
                self.received.lock().unwrap().push((self.clock, x.value, "ext"));
            }
        }
        fn delta_conf(&mut self, inputs: &[PinValue<i64>]) {
            for x in inputs {
                self.received.lock().unwrap().push((self.clock, x.value, "conf"));
            }
        }
        fn output_func(&mut self, _outputs: &mut Vec<PinValue<i64>>) {}
    }

    struct NegativeTa;

    impl Atomic<i64> for NegativeTa {
        fn ta(&self) -> f64 {
            -1.0
        }
        fn delta_int(&mut self) {}
        fn delta_ext(&mut self, _e: f64, _inputs: &[PinValue<i64>]) {}
        fn delta_conf(&mut self, _inputs: &[PinValue<i64>]) {}
        fn output_func(&mut self, _outputs: &mut Vec<PinValue<i64>>) {}
    }

    #[test]
    fn test_negative_time_advance_rejected_at_init() {
        let mut g: Graph<i64> = Graph::new();
        let id = g.add_atomic(Box::new(NegativeTa));
        let err = Simulator::new(g).err().expect("construction must fail");
        assert_eq!(err, KairosError::NegativeTimeAdvance { atomic: id, dt: -1.0 });
    }

    #[test]
    fn test_generator_delivers_to_sink() {
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        let gen = g.add_atomic(Box::new(Generator { out: pin, period: 1.0, fired: 0 }));
        let sink = Sink::default();
        let received = Arc::clone(&sink.received);
        let snk = g.add_atomic(Box::new(sink));
        g.connect_to_atomic(pin, snk).unwrap();

        let mut sim = Simulator::new(g).unwrap();
        assert_eq!(sim.next_event_time(), SuperDenseTime::real(1.0));
        for _ in 0..3 {
            sim.exec_next_event().unwrap();
        }
        let log = received.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], (1.0, 42, "ext"));
        assert_eq!(log[1], (2.0, 42, "ext"));
        assert_eq!(log[2], (3.0, 42, "ext"));
        let _ = gen;
    }

    #[test]
    fn test_next_event_time_is_monotone() {
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        g.add_atomic(Box::new(Generator { out: pin, period: 0.5, fired: 0 }));

        let mut sim = Simulator::new(g).unwrap();
        let mut last = SuperDenseTime::ZERO;
        for _ in 0..10 {
            let before = sim.next_event_time();
            assert!(before >= last, "next_event_time went backward");
            sim.exec_next_event().unwrap();
            assert!(sim.next_event_time() >= before);
            last = before;
        }
    }

    #[test]
    fn test_injection_consumed_once() {
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        let sink = Sink::default();
        let received = Arc::clone(&sink.received);
        let snk = g.add_atomic(Box::new(sink));
        g.connect_to_atomic(pin, snk).unwrap();

        let mut sim = Simulator::new(g).unwrap();
        sim.inject_input(PinValue::new(pin, 7));
        sim.set_next_time(SuperDenseTime::ZERO);
        sim.exec_next_event().unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);

        // A second macro-step observes no injection.
        sim.set_next_time(SuperDenseTime::real(1.0));
        sim.exec_next_event().unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_injected_input() {
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        let sink = Sink::default();
        let received = Arc::clone(&sink.received);
        let snk = g.add_atomic(Box::new(sink));
        g.connect_to_atomic(pin, snk).unwrap();

        let mut sim = Simulator::new(g).unwrap();
        sim.inject_input(PinValue::new(pin, 7));
        sim.clear_injected_input();
        sim.set_next_time(SuperDenseTime::ZERO);
        sim.exec_next_event().unwrap();
        assert!(received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_elapsed_time_bounds() {
        // delta_ext must see e in [0, ta(previous state)).
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        g.add_atomic(Box::new(Generator { out: pin, period: 3.0, fired: 0 }));
        let sink = Sink::default();
        let elapsed = Arc::clone(&sink.elapsed);
        let snk = g.add_atomic(Box::new(sink));
        g.connect_to_atomic(pin, snk).unwrap();

        let mut sim = Simulator::new(g).unwrap();
        for _ in 0..4 {
            sim.exec_next_event().unwrap();
        }
        // The sink passivates between deliveries, so e is the full gap.
        for e in elapsed.lock().unwrap().iter() {
            assert_eq!(*e, 3.0);
        }
    }

    #[test]
    fn test_zero_time_advance_is_superdense() {
        // A model with ta() = 0 fires again within the same real
        // instant, one ordinal later.
        struct Burst {
            out: Pin,
            remaining: u32,
        }
        impl Atomic<i64> for Burst {
            fn ta(&self) -> f64 {
                if self.remaining > 0 {
                    0.0
                } else {
                    f64::INFINITY
                }
            }
            fn delta_int(&mut self) {
                self.remaining -= 1;
            }
            fn delta_ext(&mut self, _e: f64, _inputs: &[PinValue<i64>]) {}
            fn delta_conf(&mut self, _inputs: &[PinValue<i64>]) {}
            fn output_func(&mut self, outputs: &mut Vec<PinValue<i64>>) {
                outputs.push(PinValue::new(self.out, self.remaining as i64));
            }
        }

        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        g.add_atomic(Box::new(Burst { out: pin, remaining: 3 }));
        let mut sim = Simulator::new(g).unwrap();

        assert_eq!(sim.next_event_time(), SuperDenseTime::new(0.0, 0));
        sim.exec_next_event().unwrap();
        assert_eq!(sim.next_event_time(), SuperDenseTime::new(0.0, 1));
        sim.exec_next_event().unwrap();
        assert_eq!(sim.next_event_time(), SuperDenseTime::new(0.0, 2));
        sim.exec_next_event().unwrap();
        // Passivated now.
        assert_eq!(sim.next_event_time(), SuperDenseTime::INFINITY);
    }

    #[test]
    fn test_self_influence_rejected() {
        struct Loop {
            out: Pin,
        }
        impl Atomic<i64> for Loop {
            fn ta(&self) -> f64 {
                1.0
            }
            fn delta_int(&mut self) {}
            fn delta_ext(&mut self, _e: f64, _inputs: &[PinValue<i64>]) {}
            fn delta_conf(&mut self, _inputs: &[PinValue<i64>]) {}
            fn output_func(&mut self, outputs: &mut Vec<PinValue<i64>>) {
                outputs.push(PinValue::new(self.out, 0));
            }
        }

        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        let id = g.add_atomic(Box::new(Loop { out: pin }));
        g.connect_to_atomic(pin, id).unwrap();

        let mut sim = Simulator::new(g).unwrap();
        let err = sim.exec_next_event().unwrap_err();
        assert_eq!(err, KairosError::SelfInfluence { atomic: id, pin });
    }

    #[test]
    fn test_provisional_add_is_scheduled_after_step() {
        let mut g: Graph<i64> = Graph::new();
        let pin = g.add_pin();
        g.add_atomic(Box::new(Generator { out: pin, period: 1.0, fired: 0 }));
        let mut sim = Simulator::new(g).unwrap();

        // Mutations through graph_mut() are buffered while running.
        let pin2 = sim.graph_mut().add_pin();
        let late = sim
            .graph_mut()
            .add_atomic(Box::new(Generator { out: pin2, period: 1.0, fired: 0 }));
        assert!(sim.graph().atomic(late).is_none(), "buffered add applied early");

        sim.exec_next_event().unwrap();
        assert!(sim.graph().atomic(late).is_some());
        // The late generator was scheduled relative to the drain time.
        assert!(sim.next_event_time().is_finite());
    }
}
