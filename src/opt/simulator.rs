//! Optimistic (Time-Warp) parallel executive.
//!
//! Execution proceeds in rounds: the scheduler yields a batch of logical
//! processes with the smallest next-event times, a scoped worker pool
//! runs each LP's output computation and state transition speculatively,
//! the batch and any LPs activated by message delivery are rescheduled,
//! and global virtual time — the minimum over all next-event times — is
//! recomputed. History older than GVT is permanent: fossil collection
//! reclaims it and releases the now-committed events to listeners, so an
//! observer only ever sees events that cannot be rolled back.
//!
//! Model requirements: every atomic must implement state saving, atomics
//! must not share state, and the structure must not change during a run.

use parking_lot::Mutex;

use crate::error::{KairosError, KairosResult};
use crate::graph::Graph;
use crate::listener::{EventListener, ListenerSet};
use crate::model::AtomicId;
use crate::scheduler::Scheduler;
use crate::time::SuperDenseTime;

use super::lp::{CommitKind, CommittedEvent, LogicalProcess, Mailbox, Router};

/// Default batch size: how many LPs may process an event per round.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Time-Warp executive over one logical process per atomic model.
pub struct OptSimulator<X> {
    graph: Graph<X>,
    lps: Vec<Option<LogicalProcess<X>>>,
    mailboxes: Vec<Mailbox<X>>,
    active_list: Mutex<Vec<AtomicId>>,
    sched: Scheduler,
    listeners: ListenerSet<X>,
    max_batch_size: usize,
    workers: usize,
}

impl<X: Clone + Send> OptSimulator<X> {
    /// Create an optimistic simulator with the default batch size.
    pub fn new(graph: Graph<X>) -> KairosResult<Self> {
        Self::with_batch_size(graph, DEFAULT_BATCH_SIZE)
    }

    /// Create an optimistic simulator.
    ///
    /// `max_batch_size` bounds the number of LPs that process an event
    /// in each round; it trades parallelism against the cost of
    /// speculation that may be rolled back. Construction fails if any
    /// atomic reports a negative time advance.
    pub fn with_batch_size(mut graph: Graph<X>, max_batch_size: usize) -> KairosResult<Self> {
        let slots = graph.slot_count();
        let mut lps: Vec<Option<LogicalProcess<X>>> = Vec::new();
        lps.resize_with(slots, || None);
        let mailboxes: Vec<Mailbox<X>> = (0..slots).map(|_| Mailbox::new()).collect();
        let mut sched = Scheduler::new();
        for id in graph.atomic_ids() {
            let model = graph
                .take_atomic(id)
                .ok_or(KairosError::UnknownAtomic(id))?;
            if model.is_mealy() {
                return Err(KairosError::MealyUnsupported { atomic: id });
            }
            let lp = LogicalProcess::new(id, model)?;
            sched.schedule(id, lp.next_event_time(&mailboxes[id.index()]));
            lps[id.index()] = Some(lp);
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(OptSimulator {
            graph,
            lps,
            mailboxes,
            active_list: Mutex::new(Vec::new()),
            sched,
            listeners: ListenerSet::new(),
            max_batch_size: max_batch_size.max(1),
            workers,
        })
    }

    /// Register an event listener. Only committed events — those below
    /// global virtual time — are delivered, in time order.
    pub fn add_event_listener(&mut self, listener: Box<dyn EventListener<X>>) {
        self.listeners.register(listener);
    }

    /// The real part of the earliest uncommitted event time.
    pub fn next_event_time(&self) -> f64 {
        self.sched.min_priority().t()
    }

    /// The earliest uncommitted event time in full super-dense form.
    pub fn total_next_event_time(&self) -> SuperDenseTime {
        self.sched.min_priority()
    }

    /// Run until global virtual time exceeds `stop_time`, then commit
    /// everything up to and including that instant.
    pub fn exec_until(&mut self, stop_time: f64) -> KairosResult<()> {
        let stop = if stop_time == f64::INFINITY {
            SuperDenseTime::INFINITY
        } else {
            SuperDenseTime::new(stop_time, u64::MAX)
        };
        self.run_until(stop)
    }

    fn run_until(&mut self, stop: SuperDenseTime) -> KairosResult<()> {
        let mut gvt = self.sched.min_priority();
        while gvt <= stop && gvt.is_finite() {
            // Everything below the current GVT is permanent.
            self.fossil_collect(gvt);

            // Extract the batch of LPs with the smallest next-event
            // times and mark them active so message delivery does not
            // re-enqueue them.
            let mut batch: Vec<(AtomicId, LogicalProcess<X>)> = Vec::new();
            while batch.len() < self.max_batch_size {
                let Some((id, _)) = self.sched.pop_min() else {
                    break;
                };
                self.mailboxes[id.index()].set_active(true);
                let lp = self.lps[id.index()].take().expect("scheduled LP missing");
                batch.push((id, lp));
            }

            // Parallel phase: output computation then state transition,
            // per LP, across the worker pool.
            let router = Router {
                coupling: self.graph.coupling(),
                mailboxes: &self.mailboxes,
                active_list: &self.active_list,
            };
            let mut phase_result: KairosResult<()> = Ok(());
            if self.workers <= 1 || batch.len() <= 1 {
                for (_, lp) in batch.iter_mut() {
                    if let Err(err) = Self::run_lp(lp, &router) {
                        phase_result = Err(err);
                        break;
                    }
                }
            } else {
                let chunk_size = batch.len().div_ceil(self.workers);
                let results: Vec<KairosResult<()>> = std::thread::scope(|scope| {
                    let router = &router;
                    let handles: Vec<_> = batch
                        .chunks_mut(chunk_size)
                        .map(|chunk| {
                            scope.spawn(move || {
                                for (_, lp) in chunk.iter_mut() {
                                    Self::run_lp(lp, router)?;
                                }
                                Ok(())
                            })
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| h.join().expect("optimistic worker panicked"))
                        .collect()
                });
                if let Some(err) = results.into_iter().find_map(|r| r.err()) {
                    phase_result = Err(err);
                }
            }

            // Reschedule the batch and reset its active flags.
            for (id, lp) in batch {
                let t_next = lp.next_event_time(&self.mailboxes[id.index()]);
                self.sched.schedule(id, t_next);
                self.mailboxes[id.index()].set_active(false);
                self.lps[id.index()] = Some(lp);
            }
            phase_result?;

            // Schedule the LPs activated by message delivery.
            let activated = std::mem::take(&mut *self.active_list.lock());
            for id in activated {
                let lp = self.lps[id.index()].as_ref().expect("activated LP missing");
                let t_next = lp.next_event_time(&self.mailboxes[id.index()]);
                self.sched.schedule(id, t_next);
                self.mailboxes[id.index()].set_active(false);
            }

            gvt = self.sched.min_priority();
        }
        // Commit up to the stop bound.
        let effective = if gvt > stop { stop } else { gvt };
        self.fossil_collect(effective);
        Ok(())
    }

    fn run_lp(lp: &mut LogicalProcess<X>, router: &Router<'_, X>) -> KairosResult<()> {
        lp.exec_output(router)?;
        let incoming = router.mailboxes[lp.id().index()].drain();
        lp.exec_transitions(incoming)
    }

    /// Reclaim history below `gvt` on every LP and deliver the
    /// committed events to listeners in (time, kind, model) order.
    fn fossil_collect(&mut self, gvt: SuperDenseTime) {
        let mut committed: Vec<CommittedEvent<X>> = Vec::new();
        for lp in self.lps.iter_mut().flatten() {
            committed.extend(lp.fossil_collect(gvt));
        }
        if committed.is_empty() {
            return;
        }
        log::trace!("committing {} events below gvt {}", committed.len(), gvt);
        committed.sort_by(|a, b| {
            a.t.cmp(&b.t)
                .then_with(|| a.kind.rank().cmp(&b.kind.rank()))
                .then_with(|| a.atomic.cmp(&b.atomic))
        });
        for event in committed {
            match &event.kind {
                CommitKind::Output(pv) => self.listeners.notify_output(event.atomic, pv, event.t),
                CommitKind::Input(pv) => self.listeners.notify_input(event.atomic, pv, event.t),
                CommitKind::StateChange => self.listeners.notify_state_change(event.atomic, event.t),
            }
        }
    }
}

impl<X> OptSimulator<X> {
    /// Tear the simulator down and hand the coupled model back, with
    /// every atomic restored to the graph.
    pub fn into_graph(mut self) -> Graph<X> {
        let lps = std::mem::take(&mut self.lps);
        let mut graph = std::mem::take(&mut self.graph);
        for lp in lps.into_iter().flatten() {
            let id = lp.id();
            graph.put_atomic(id, lp.into_model());
        }
        graph
    }
}

/// Teardown releases every checkpoint and retired output through the
/// model-level `gc_state`/`gc_output` hooks, exactly once each.
impl<X> Drop for OptSimulator<X> {
    fn drop(&mut self) {
        for lp in self.lps.iter_mut().flatten() {
            lp.drain_gc();
        }
    }
}
