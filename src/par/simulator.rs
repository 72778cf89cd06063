//! Conservative parallel executive.
//!
//! Atomics are pinned to a fixed set of logical processes, one worker
//! thread each, synchronized purely by message passing. An LP advances
//! its local clock only strictly below its earliest-input-time bound —
//! the smallest timestamp any incoming neighbor might still send. Each
//! LP keeps its neighbors informed with null messages carrying its
//! *horizon*: the earliest time it could possibly emit an event, which
//! is its next local event or its own bound plus the models' lookahead,
//! whichever is smaller. Positive lookahead is what lets two mutually
//! coupled LPs ratchet each other forward instead of deadlocking, so it
//! is validated at construction.
//!
//! There is no rollback and no global clock: `exec_until` is the only
//! driver, and input cannot be injected while a run is in progress.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::mpsc::{channel, Receiver, Sender};

use parking_lot::Mutex;

use crate::error::{KairosError, KairosResult};
use crate::graph::{Coupling, Graph};
use crate::listener::EventListener;
use crate::model::{Atomic, AtomicId, PinValue};
use crate::scheduler::Scheduler;
use crate::time::SuperDenseTime;

use super::lp_graph::LpGraph;

/// A message between conservative LPs.
enum CmbMessage<X> {
    /// Promise: the sender will emit nothing earlier than `horizon`.
    Null { src: usize, horizon: SuperDenseTime },
    /// An input event for `target`, implying the same promise at `t`.
    Event {
        src: usize,
        t: SuperDenseTime,
        target: AtomicId,
        input: PinValue<X>,
    },
}

/// An input event waiting for its instant to become safe.
struct PendingInput<X> {
    t: SuperDenseTime,
    seq: u64,
    target: AtomicId,
    input: PinValue<X>,
}

impl<X> PartialEq for PendingInput<X> {
    fn eq(&self, other: &Self) -> bool {
        self.t == other.t && self.seq == other.seq
    }
}

impl<X> Eq for PendingInput<X> {}

impl<X> PartialOrd for PendingInput<X> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so `BinaryHeap` pops the earliest (t, seq) first.
impl<X> Ord for PendingInput<X> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .t
            .cmp(&self.t)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Per-atomic state owned by a conservative LP across runs.
struct ConsCore<X> {
    id: AtomicId,
    model: Box<dyn Atomic<X>>,
    t_last: SuperDenseTime,
    t_next: SuperDenseTime,
}

type SharedListeners<X> = Mutex<Vec<Box<dyn EventListener<X> + Send>>>;

/// Lookahead-based parallel executive over a coupling of logical
/// processes.
pub struct ParSimulator<X> {
    graph: Graph<X>,
    /// Cores grouped by owning LP; the assignment is fixed at
    /// construction.
    partitions: Vec<Vec<ConsCore<X>>>,
    /// Atomic slab index → owning LP.
    owners: Vec<Option<usize>>,
    lp_graph: LpGraph,
    lp_count: usize,
    listeners: SharedListeners<X>,
}

impl<X: Clone + Send> ParSimulator<X> {
    /// Create a conservative simulator with one LP per available core
    /// and the default all-to-all LP coupling.
    pub fn new(graph: Graph<X>) -> KairosResult<Self> {
        let workers = default_workers();
        Self::with_workers(graph, workers, LpGraph::all_to_all(workers))
    }

    /// Create a conservative simulator with a caller-supplied LP
    /// coupling graph describing which processes feed which.
    pub fn with_lp_graph(graph: Graph<X>, lp_graph: LpGraph) -> KairosResult<Self> {
        Self::with_workers(graph, default_workers(), lp_graph)
    }

    /// Create a conservative simulator over exactly `lp_count` logical
    /// processes.
    ///
    /// Every atomic must have a positive lookahead and must not be a
    /// Mealy model; atomics are pinned by their processor hint, or by
    /// hashing their identity when the hint is absent or out of range.
    pub fn with_workers(
        mut graph: Graph<X>,
        lp_count: usize,
        lp_graph: LpGraph,
    ) -> KairosResult<Self> {
        let lp_count = lp_count.max(1);
        let mut partitions: Vec<Vec<ConsCore<X>>> = (0..lp_count).map(|_| Vec::new()).collect();
        let mut owners: Vec<Option<usize>> = vec![None; graph.slot_count()];
        for id in graph.atomic_ids() {
            let model = graph
                .take_atomic(id)
                .ok_or(KairosError::UnknownAtomic(id))?;
            if model.is_mealy() {
                return Err(KairosError::MealyUnsupported { atomic: id });
            }
            let lookahead = model.lookahead();
            if lookahead <= 0.0 {
                return Err(KairosError::NonPositiveLookahead {
                    atomic: id,
                    lookahead,
                });
            }
            let dt = model.ta();
            if dt < 0.0 {
                return Err(KairosError::NegativeTimeAdvance { atomic: id, dt });
            }
            let lp = match model.processor_hint() {
                Some(hint) if hint < lp_count => hint,
                _ => id.raw() as usize % lp_count,
            };
            owners[id.index()] = Some(lp);
            let t_next = if dt.is_finite() {
                SuperDenseTime::real(dt)
            } else {
                SuperDenseTime::INFINITY
            };
            partitions[lp].push(ConsCore {
                id,
                model,
                t_last: SuperDenseTime::ZERO,
                t_next,
            });
        }
        Ok(ParSimulator {
            graph,
            partitions,
            owners,
            lp_graph,
            lp_count,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Register an event listener. The conservative engine notifies from
    /// worker threads, so listeners must be `Send`; callbacks run under
    /// a shared lock in registration order.
    pub fn add_event_listener(&mut self, listener: Box<dyn EventListener<X> + Send>) {
        self.listeners.lock().push(listener);
    }

    /// The real part of the earliest next-event time across all LPs.
    pub fn next_event_time(&self) -> f64 {
        self.partitions
            .iter()
            .flatten()
            .map(|core| core.t_next)
            .min()
            .unwrap_or(SuperDenseTime::INFINITY)
            .t()
    }

    /// Run every logical process until nothing can happen at or before
    /// `stop_time`. There is no global clock; the stop time is the only
    /// thing that ends the run.
    pub fn exec_until(&mut self, stop_time: f64) -> KairosResult<()> {
        let stop = if stop_time == f64::INFINITY {
            SuperDenseTime::INFINITY
        } else {
            SuperDenseTime::new(stop_time, u64::MAX)
        };

        // One channel per LP; each LP holds sender clones for its
        // outgoing neighbors only.
        let mut txs: Vec<Sender<CmbMessage<X>>> = Vec::with_capacity(self.lp_count);
        let mut rxs: Vec<Receiver<CmbMessage<X>>> = Vec::with_capacity(self.lp_count);
        for _ in 0..self.lp_count {
            let (tx, rx) = channel();
            txs.push(tx);
            rxs.push(rx);
        }
        let mut endpoints: Vec<(Receiver<CmbMessage<X>>, Vec<(usize, Sender<CmbMessage<X>>)>)> =
            Vec::with_capacity(self.lp_count);
        for (lp, rx) in rxs.into_iter().enumerate() {
            let outgoing = self
                .lp_graph
                .outgoing(lp)
                .into_iter()
                .filter(|&dst| dst < self.lp_count)
                .map(|dst| (dst, txs[dst].clone()))
                .collect();
            endpoints.push((rx, outgoing));
        }
        drop(txs);

        let coupling = self.graph.coupling();
        let owners = &self.owners;
        let listeners = &self.listeners;
        let lp_graph = &self.lp_graph;
        let lp_count = self.lp_count;
        let results: Vec<KairosResult<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .partitions
                .iter_mut()
                .zip(endpoints)
                .enumerate()
                .map(|(lp, (cores, (rx, outgoing)))| {
                    let incoming: Vec<usize> = lp_graph
                        .incoming(lp)
                        .into_iter()
                        .filter(|&src| src < lp_count)
                        .collect();
                    scope.spawn(move || {
                        LpWorker {
                            lp,
                            cores,
                            rx,
                            outgoing,
                            coupling,
                            owners,
                            listeners,
                            stop,
                            sched: Scheduler::new(),
                            index: BTreeMap::new(),
                            pending: BinaryHeap::new(),
                            eit: incoming
                                .iter()
                                .map(|&src| (src, SuperDenseTime::ZERO))
                                .collect(),
                            lookahead: f64::INFINITY,
                            last_horizon: None,
                            emitted_at: None,
                            seq: 0,
                        }
                        .run()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("conservative worker panicked"))
                .collect()
        });
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }
}

impl<X> ParSimulator<X> {
    /// Tear the simulator down and hand the coupled model back.
    pub fn into_graph(mut self) -> Graph<X> {
        let partitions = std::mem::take(&mut self.partitions);
        for core in partitions.into_iter().flatten() {
            self.graph.put_atomic(core.id, core.model);
        }
        self.graph
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One conservative LP for the duration of a single `exec_until`.
struct LpWorker<'a, X> {
    lp: usize,
    cores: &'a mut Vec<ConsCore<X>>,
    rx: Receiver<CmbMessage<X>>,
    outgoing: Vec<(usize, Sender<CmbMessage<X>>)>,
    coupling: &'a Coupling,
    owners: &'a [Option<usize>],
    listeners: &'a SharedListeners<X>,
    stop: SuperDenseTime,
    sched: Scheduler,
    index: BTreeMap<AtomicId, usize>,
    pending: BinaryHeap<PendingInput<X>>,
    /// Earliest input time promised by each incoming neighbor.
    eit: BTreeMap<usize, SuperDenseTime>,
    lookahead: f64,
    last_horizon: Option<SuperDenseTime>,
    /// Instant whose outputs have already been produced and sent, ahead
    /// of the transition. See `emit_outputs`.
    emitted_at: Option<SuperDenseTime>,
    seq: u64,
}

impl<X: Clone + Send> LpWorker<'_, X> {
    fn run(mut self) -> KairosResult<()> {
        for (pos, core) in self.cores.iter().enumerate() {
            self.index.insert(core.id, pos);
            self.sched.schedule(core.id, core.t_next);
            self.lookahead = self.lookahead.min(core.model.lookahead());
        }
        self.announce();
        loop {
            while let Ok(msg) = self.rx.try_recv() {
                self.handle(msg);
            }
            let bound = self.min_eit();
            let local_next = self.local_next();
            if local_next.is_finite() && local_next < bound && local_next <= self.stop {
                self.step(local_next)?;
                self.announce();
                continue;
            }
            // Exact tie with the bound: the tied inputs cannot change our
            // outputs (Moore models, positive lookahead), so produce and
            // send them now and promise nothing further at this instant.
            // That is what lets two LPs with simultaneous events ratchet
            // past each other — and exchange confluent inputs correctly.
            if local_next.is_finite()
                && local_next == bound
                && local_next <= self.stop
                && self.emitted_at != Some(local_next)
            {
                self.emit_outputs(local_next)?;
                self.announce();
                continue;
            }
            if bound > self.stop {
                break;
            }
            // Cannot advance: wait for a neighbor to push its promise
            // forward. Make sure our own promise is out first.
            self.announce();
            match self.rx.recv() {
                Ok(msg) => {
                    self.handle(msg);
                    self.announce();
                }
                Err(_) => {
                    // Every upstream sender is gone; nothing more can
                    // arrive.
                    for bound in self.eit.values_mut() {
                        *bound = SuperDenseTime::INFINITY;
                    }
                }
            }
        }
        // Unblock downstream neighbors waiting on our promise.
        for (_, tx) in &self.outgoing {
            let _ = tx.send(CmbMessage::Null {
                src: self.lp,
                horizon: SuperDenseTime::INFINITY,
            });
        }
        log::debug!("conservative lp {} finished at stop {}", self.lp, self.stop);
        Ok(())
    }

    fn handle(&mut self, msg: CmbMessage<X>) {
        match msg {
            CmbMessage::Null { src, horizon } => {
                if let Some(bound) = self.eit.get_mut(&src) {
                    if horizon > *bound {
                        *bound = horizon;
                    }
                }
            }
            CmbMessage::Event {
                src,
                t,
                target,
                input,
            } => {
                // Channels are FIFO, so an event at t implies nothing
                // earlier than t will follow from this neighbor.
                if let Some(bound) = self.eit.get_mut(&src) {
                    if t > *bound {
                        *bound = t;
                    }
                }
                self.seq += 1;
                self.pending.push(PendingInput {
                    t,
                    seq: self.seq,
                    target,
                    input,
                });
            }
        }
    }

    /// Smallest timestamp any incoming neighbor might still send.
    fn min_eit(&self) -> SuperDenseTime {
        self.eit
            .values()
            .copied()
            .min()
            .unwrap_or(SuperDenseTime::INFINITY)
    }

    /// Earliest local work: own schedule or a buffered input event.
    fn local_next(&self) -> SuperDenseTime {
        let mut t = self.sched.min_priority();
        if let Some(first) = self.pending.peek() {
            if first.t < t {
                t = first.t;
            }
        }
        t
    }

    /// Tell outgoing neighbors the earliest time we could emit an
    /// event, when that promise has improved.
    fn announce(&mut self) {
        let mut horizon = self.local_next();
        // Once this instant's outputs are out the door, nothing more
        // will be sent at it.
        if self.emitted_at == Some(horizon) {
            horizon = horizon + SuperDenseTime::EPSILON;
        }
        let credited = self.min_eit() + SuperDenseTime::real(self.lookahead);
        if credited < horizon {
            horizon = credited;
        }
        if self.last_horizon.map_or(true, |prev| horizon > prev) {
            for (_, tx) in &self.outgoing {
                let _ = tx.send(CmbMessage::Null {
                    src: self.lp,
                    horizon,
                });
            }
            self.last_horizon = Some(horizon);
        }
    }

    /// Produce the outputs of every atomic imminent at `t` and route
    /// them: remote receivers get an event message, local receivers are
    /// queued as pending inputs for the `t` macro-step.
    fn emit_outputs(&mut self, t: SuperDenseTime) -> KairosResult<()> {
        self.emitted_at = Some(t);
        let imminent: Vec<AtomicId> = if self.sched.min_priority() == t {
            self.sched.visit_imminent()
        } else {
            Vec::new()
        };
        for &id in &imminent {
            let mut outputs = Vec::new();
            self.core_mut(id)?.model.output_func(&mut outputs);
            for y in outputs {
                {
                    let mut listeners = self.listeners.lock();
                    for l in listeners.iter_mut() {
                        l.output_event(id, &y, t);
                    }
                }
                for (pin, target) in self.coupling.route(y.pin)? {
                    if target == id {
                        return Err(KairosError::SelfInfluence { atomic: id, pin });
                    }
                    let owner = self.owners[target.index()]
                        .ok_or(KairosError::UnknownAtomic(target))?;
                    let delivered = PinValue::new(pin, y.value.clone());
                    if owner == self.lp {
                        self.seq += 1;
                        self.pending.push(PendingInput {
                            t,
                            seq: self.seq,
                            target,
                            input: delivered,
                        });
                    } else {
                        let tx = self
                            .outgoing
                            .iter()
                            .find(|(dst, _)| *dst == owner)
                            .ok_or(KairosError::MissingLpEdge {
                                from: self.lp,
                                to: owner,
                            })?;
                        let _ = tx.1.send(CmbMessage::Event {
                            src: self.lp,
                            t,
                            target,
                            input: delivered,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Execute one macro-step at `t`: produce and route outputs (unless
    /// already emitted at the tie), deliver buffered inputs, apply
    /// transitions, reschedule.
    fn step(&mut self, t: SuperDenseTime) -> KairosResult<()> {
        if self.emitted_at != Some(t) {
            self.emit_outputs(t)?;
        }
        self.emitted_at = None;
        let mut inputs: BTreeMap<AtomicId, Vec<PinValue<X>>> = BTreeMap::new();
        while self.pending.peek().map_or(false, |p| p.t == t) {
            if let Some(p) = self.pending.pop() {
                inputs.entry(p.target).or_default().push(p.input);
            }
        }
        let imminent: Vec<AtomicId> = if self.sched.min_priority() == t {
            self.sched.visit_imminent()
        } else {
            Vec::new()
        };

        // Transition phase.
        let t_after = t + SuperDenseTime::EPSILON;
        for &id in &imminent {
            let bag = inputs.remove(&id);
            self.notify_inputs(id, bag.as_deref(), t);
            {
                let core = self.core_mut(id)?;
                match &bag {
                    Some(bag) => core.model.delta_conf(bag),
                    None => core.model.delta_int(),
                }
            }
            self.finish_transition(id, t, t_after)?;
        }
        for (id, bag) in inputs {
            self.notify_inputs(id, Some(&bag), t);
            {
                let core = self.core_mut(id)?;
                let e = t.elapsed_since(core.t_last);
                core.model.delta_ext(e, &bag);
            }
            self.finish_transition(id, t, t_after)?;
        }
        Ok(())
    }

    fn notify_inputs(&self, id: AtomicId, bag: Option<&[PinValue<X>]>, t: SuperDenseTime) {
        let Some(bag) = bag else { return };
        let mut listeners = self.listeners.lock();
        for x in bag {
            for l in listeners.iter_mut() {
                l.input_event(id, x, t);
            }
        }
    }

    fn finish_transition(
        &mut self,
        id: AtomicId,
        t: SuperDenseTime,
        t_after: SuperDenseTime,
    ) -> KairosResult<()> {
        {
            let mut listeners = self.listeners.lock();
            for l in listeners.iter_mut() {
                l.state_change(id, t);
            }
        }
        let core = self.core_mut(id)?;
        core.t_last = t_after;
        let dt = core.model.ta();
        if dt < 0.0 {
            return Err(KairosError::NegativeTimeAdvance { atomic: id, dt });
        }
        core.t_next = if dt.is_finite() {
            t_after + SuperDenseTime::real(dt)
        } else {
            SuperDenseTime::INFINITY
        };
        let t_next = core.t_next;
        self.sched.schedule(id, t_next);
        Ok(())
    }

    fn core_mut(&mut self, id: AtomicId) -> KairosResult<&mut ConsCore<X>> {
        let pos = *self
            .index
            .get(&id)
            .ok_or(KairosError::UnknownAtomic(id))?;
        Ok(&mut self.cores[pos])
    }
}
