//! Logical processes for the optimistic engine.
//!
//! Every atomic model gets a logical process that simulates it
//! speculatively. The LP is split in two so the aliasing rules mirror
//! the lock discipline: the [`Mailbox`] (input queue, minimum input
//! timestamp, active flag) is shared and lock-protected, while the
//! [`LogicalProcess`] core (message history, checkpoints, recipients,
//! the model itself) is touched only by the worker currently executing
//! that LP.
//!
//! A causality violation — an input in the local past, or the
//! cancellation of an already-processed message — triggers a rollback:
//! speculative outputs move to the discard queue for later recall by
//! anti-messages, checkpoints newer than the violation are released, the
//! model state is restored, and processed messages that are again in the
//! future are replayed.

use std::collections::{BTreeSet, VecDeque};

use parking_lot::Mutex;

use crate::error::{KairosError, KairosResult};
use crate::graph::Coupling;
use crate::model::{Atomic, AtomicId, PinValue, StateHandle};
use crate::time::SuperDenseTime;

use super::message::{Message, MessageKind};

/// A saved model state with the last-event time it belongs to.
struct Checkpoint {
    t: SuperDenseTime,
    /// `None` means the model had no observable state to save; the
    /// engine never restores from it.
    state: Option<StateHandle>,
}

/// The lock-protected, shared half of a logical process.
pub(crate) struct Mailbox<X> {
    inner: Mutex<MailboxInner<X>>,
}

struct MailboxInner<X> {
    queue: Vec<Message<X>>,
    t_min_input: SuperDenseTime,
    active: bool,
}

impl<X> Mailbox<X> {
    pub(crate) fn new() -> Self {
        Mailbox {
            inner: Mutex::new(MailboxInner {
                queue: Vec::new(),
                t_min_input: SuperDenseTime::INFINITY,
                active: false,
            }),
        }
    }

    /// Append a message. Returns `true` if the LP was inactive and has
    /// just been marked active — the caller must then enqueue it on the
    /// global active list.
    pub(crate) fn post(&self, msg: Message<X>) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.is_empty() || msg.t < inner.t_min_input {
            inner.t_min_input = msg.t;
        }
        inner.queue.push(msg);
        if !inner.active {
            inner.active = true;
            true
        } else {
            false
        }
    }

    /// Take every queued message, resetting the minimum input timestamp.
    pub(crate) fn drain(&self) -> Vec<Message<X>> {
        let mut inner = self.inner.lock();
        inner.t_min_input = SuperDenseTime::INFINITY;
        std::mem::take(&mut inner.queue)
    }

    /// Smallest timestamp among queued messages, if any are queued.
    pub(crate) fn min_input_time(&self) -> Option<SuperDenseTime> {
        let inner = self.inner.lock();
        if inner.queue.is_empty() {
            None
        } else {
            Some(inner.t_min_input)
        }
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.inner.lock().active = active;
    }
}

/// Routing context handed to an LP during its parallel phase: the
/// coupling for `route`, every mailbox, and the global active list.
pub(crate) struct Router<'a, X> {
    pub(crate) coupling: &'a Coupling,
    pub(crate) mailboxes: &'a [Mailbox<X>],
    pub(crate) active_list: &'a Mutex<Vec<AtomicId>>,
}

impl<X> Router<'_, X> {
    fn send(&self, target: AtomicId, msg: Message<X>) {
        if self.mailboxes[target.index()].post(msg) {
            self.active_list.lock().push(target);
        }
    }
}

/// A committed event released to listeners at fossil collection.
pub(crate) struct CommittedEvent<X> {
    pub(crate) t: SuperDenseTime,
    pub(crate) atomic: AtomicId,
    pub(crate) kind: CommitKind<X>,
}

pub(crate) enum CommitKind<X> {
    Output(PinValue<X>),
    Input(PinValue<X>),
    StateChange,
}

impl<X> CommitKind<X> {
    /// Dispatch order within one instant: outputs, then inputs, then
    /// state changes — the order the sequential engine would produce.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            CommitKind::Output(_) => 0,
            CommitKind::Input(_) => 1,
            CommitKind::StateChange => 2,
        }
    }
}

/// The exclusive half of a logical process: message history, outputs,
/// checkpoints, and the atomic model it drives.
pub(crate) struct LogicalProcess<X> {
    id: AtomicId,
    model: Box<dyn Atomic<X>>,
    /// Last-event time of the current model state.
    t_last: SuperDenseTime,
    /// Time advance in the present state.
    time_advance: f64,
    /// Unprocessed input messages, time-ordered.
    avail: VecDeque<Message<X>>,
    /// Processed input messages, time-ordered.
    used: VecDeque<Message<X>>,
    /// Speculative outputs believed correct, time-ordered.
    good: VecDeque<(SuperDenseTime, PinValue<X>)>,
    /// Outputs recalled by rollback, awaiting gc, time-ordered.
    discard: VecDeque<(SuperDenseTime, PinValue<X>)>,
    /// Checkpoint stack, time-ordered (oldest first).
    checkpoints: Vec<Checkpoint>,
    /// LPs this one has sent messages to.
    recipients: BTreeSet<AtomicId>,
    /// Pending rollback notification time, if any.
    rb_pending: Option<SuperDenseTime>,
    /// Times of speculative state transitions, for committed
    /// state-change notifications.
    transitions: VecDeque<SuperDenseTime>,
    /// Scratch input bag.
    bag: Vec<PinValue<X>>,
}

impl<X> LogicalProcess<X> {
    pub(crate) fn new(id: AtomicId, model: Box<dyn Atomic<X>>) -> KairosResult<Self> {
        let time_advance = model.ta();
        if time_advance < 0.0 {
            return Err(KairosError::NegativeTimeAdvance {
                atomic: id,
                dt: time_advance,
            });
        }
        Ok(LogicalProcess {
            id,
            model,
            t_last: SuperDenseTime::ZERO,
            time_advance,
            avail: VecDeque::new(),
            used: VecDeque::new(),
            good: VecDeque::new(),
            discard: VecDeque::new(),
            checkpoints: Vec::new(),
            recipients: BTreeSet::new(),
            rb_pending: None,
            transitions: VecDeque::new(),
            bag: Vec::new(),
        })
    }

    pub(crate) fn id(&self) -> AtomicId {
        self.id
    }

    /// Smallest of the local next-event time, the first available input,
    /// the first queued input, and the pending rollback time.
    pub(crate) fn next_event_time(&self, mailbox: &Mailbox<X>) -> SuperDenseTime {
        let mut result = SuperDenseTime::INFINITY;
        if self.time_advance.is_finite() {
            result = self.t_last + SuperDenseTime::real(self.time_advance);
        }
        if let Some(front) = self.avail.front() {
            if front.t < result {
                result = front.t;
            }
        }
        if let Some(t_min) = mailbox.min_input_time() {
            if t_min < result {
                result = t_min;
            }
        }
        if let Some(rb) = self.rb_pending {
            if rb < result {
                result = rb;
            }
        }
        result
    }

    /// Speculatively execute the output function, assuming the next
    /// event is internal. Pending anti-messages go out first so that
    /// downstream LPs learn of a rollback before any fresh output.
    pub(crate) fn exec_output(&mut self, router: &Router<'_, X>) -> KairosResult<()>
    where
        X: Clone,
    {
        if let Some(rb_t) = self.rb_pending.take() {
            log::debug!("lp {}: anti-messages for t >= {}", self.id, rb_t);
            for &dst in &self.recipients {
                router.send(
                    dst,
                    Message {
                        t: rb_t,
                        src: self.id,
                        kind: MessageKind::Rollback,
                    },
                );
            }
        }
        if self.time_advance.is_finite() {
            let msg_t = self.t_last + SuperDenseTime::real(self.time_advance);
            let mut outputs = Vec::new();
            self.model.output_func(&mut outputs);
            for y in outputs {
                debug_assert!(self.good.back().map_or(true, |(t, _)| *t <= msg_t));
                for (pin, target) in router.coupling.route(y.pin)? {
                    if target == self.id {
                        return Err(KairosError::SelfInfluence {
                            atomic: self.id,
                            pin,
                        });
                    }
                    router.send(
                        target,
                        Message {
                            t: msg_t,
                            src: self.id,
                            kind: MessageKind::Io(PinValue::new(pin, y.value.clone())),
                        },
                    );
                    self.recipients.insert(target);
                }
                self.good.push_back((msg_t, y));
            }
        }
        Ok(())
    }

    /// Apply queued input and execute the state transition at the LP's
    /// next event, rolling back first if causality was violated.
    pub(crate) fn exec_transitions(&mut self, incoming: Vec<Message<X>>) -> KairosResult<()>
    where
        X: Clone,
    {
        for msg in incoming {
            let msg_t = msg.t;
            let mut used_cancelled = false;
            let is_io = !msg.is_rollback();
            match msg.kind {
                MessageKind::Rollback => {
                    let src = msg.src;
                    self.avail.retain(|m| !(m.src == src && m.t >= msg_t));
                    let before = self.used.len();
                    self.used.retain(|m| !(m.src == src && m.t >= msg_t));
                    used_cancelled = self.used.len() != before;
                }
                MessageKind::Io(_) => {
                    insert_message(&mut self.avail, msg);
                }
            }
            if (is_io && msg_t < self.t_last) || used_cancelled {
                self.rollback(msg_t)?;
            }
        }

        // Time of the next internal event for the current state.
        let t_self = if self.time_advance.is_finite() {
            self.t_last + SuperDenseTime::real(self.time_advance)
        } else {
            SuperDenseTime::INFINITY
        };
        let mut t_n = t_self;
        if let Some(front) = self.avail.front() {
            if front.t < t_n {
                t_n = front.t;
            }
        }
        self.bag.clear();
        while let Some(m) = self.avail.pop_front() {
            if m.t == t_n {
                if let MessageKind::Io(pv) = &m.kind {
                    self.bag.push(pv.clone());
                }
                debug_assert!(self.used.back().map_or(true, |u| u.t <= m.t));
                self.used.push_back(m);
            } else {
                self.avail.push_front(m);
                break;
            }
        }
        debug_assert!(t_n <= t_self);

        // Input preempted our own next event: the output already sent
        // for t_self is wrong and must be recalled.
        if self.rb_pending.is_none() && self.time_advance.is_finite() && t_n < t_self {
            self.rb_pending = Some(t_self);
            while let Some(rec) = self.good.pop_back() {
                if rec.0 == t_self {
                    insert_output(&mut self.discard, rec);
                } else {
                    self.good.push_back(rec);
                    break;
                }
            }
        }

        if t_n.is_infinite() {
            return Ok(());
        }
        debug_assert!(self.t_last <= t_n);
        self.checkpoints.push(Checkpoint {
            t: self.t_last,
            state: self.model.save_state(),
        });
        if self.bag.is_empty() {
            self.model.delta_int();
        } else if t_n == t_self {
            self.model.delta_conf(&self.bag);
        } else {
            self.model.delta_ext(t_n.elapsed_since(self.t_last), &self.bag);
        }
        self.transitions.push_back(t_n);
        self.time_advance = self.model.ta();
        if self.time_advance < 0.0 {
            return Err(KairosError::NegativeTimeAdvance {
                atomic: self.id,
                dt: self.time_advance,
            });
        }
        self.t_last = t_n + SuperDenseTime::EPSILON;
        Ok(())
    }

    /// Restore the chronologically latest checkpoint at or before `to`
    /// and schedule an anti-message at `to + (0, 1)`.
    fn rollback(&mut self, to: SuperDenseTime) -> KairosResult<()> {
        log::debug!("lp {}: rollback to {}", self.id, to);
        // Outputs newer than the violation will be recalled.
        while let Some(rec) = self.good.pop_back() {
            if rec.0 > to {
                insert_output(&mut self.discard, rec);
            } else {
                self.good.push_back(rec);
                break;
            }
        }
        // Release checkpoints newer than the violation.
        while let Some(c) = self.checkpoints.last() {
            if c.t <= to {
                break;
            }
            let c = self.checkpoints.pop().expect("checked non-empty");
            if let Some(state) = c.state {
                self.model.gc_state(state);
            }
            assert!(
                !self.checkpoints.is_empty(),
                "rollback popped the last checkpoint"
            );
        }
        // Restore from the latest remaining checkpoint and consume it.
        let c = self
            .checkpoints
            .pop()
            .expect("rollback requires a checkpoint");
        self.t_last = c.t;
        if let Some(state) = &c.state {
            self.model.restore_state(state);
        }
        self.time_advance = self.model.ta();
        if self.time_advance < 0.0 {
            return Err(KairosError::NegativeTimeAdvance {
                atomic: self.id,
                dt: self.time_advance,
            });
        }
        if let Some(state) = c.state {
            self.model.gc_state(state);
        }
        // Every transition from the restored state onward never
        // happened, including the one the restored checkpoint was saved
        // for.
        while let Some(t) = self.transitions.pop_back() {
            if t < self.t_last {
                self.transitions.push_back(t);
                break;
            }
        }
        // Processed messages that are again in the future are replayed.
        while let Some(m) = self.used.pop_back() {
            if m.t >= self.t_last {
                debug_assert!(self.avail.front().map_or(true, |a| m.t <= a.t));
                self.avail.push_front(m);
            } else {
                self.used.push_back(m);
                break;
            }
        }
        let rb_at = to + SuperDenseTime::EPSILON;
        self.rb_pending = Some(match self.rb_pending {
            Some(existing) if existing < rb_at => existing,
            _ => rb_at,
        });
        Ok(())
    }

    /// Reclaim history older than `gvt` and return the events that are
    /// now committed, oldest first.
    ///
    /// One checkpoint below `gvt` is kept as a backstop. Every retired
    /// output value — committed or discarded — is handed to the model's
    /// `gc_output` exactly once.
    pub(crate) fn fossil_collect(&mut self, gvt: SuperDenseTime) -> Vec<CommittedEvent<X>>
    where
        X: Clone,
    {
        let mut committed = Vec::new();
        while self.checkpoints.len() >= 2 && self.checkpoints[1].t < gvt {
            let c = self.checkpoints.remove(0);
            if let Some(state) = c.state {
                self.model.gc_state(state);
            }
        }
        while let Some(m) = self.used.pop_front() {
            if m.t < gvt {
                if let MessageKind::Io(pv) = m.kind {
                    committed.push(CommittedEvent {
                        t: m.t,
                        atomic: self.id,
                        kind: CommitKind::Input(pv),
                    });
                }
            } else {
                self.used.push_front(m);
                break;
            }
        }
        let mut retired: Vec<PinValue<X>> = Vec::new();
        while let Some((t, pv)) = self.discard.pop_front() {
            if t < gvt {
                retired.push(pv);
            } else {
                self.discard.push_front((t, pv));
                break;
            }
        }
        while let Some((t, pv)) = self.good.pop_front() {
            if t < gvt {
                committed.push(CommittedEvent {
                    t,
                    atomic: self.id,
                    kind: CommitKind::Output(pv.clone()),
                });
                retired.push(pv);
            } else {
                self.good.push_front((t, pv));
                break;
            }
        }
        while let Some(t) = self.transitions.pop_front() {
            if t < gvt {
                committed.push(CommittedEvent {
                    t,
                    atomic: self.id,
                    kind: CommitKind::StateChange,
                });
            } else {
                self.transitions.push_front(t);
                break;
            }
        }
        if !retired.is_empty() {
            self.model.gc_output(retired);
        }
        committed
    }

    /// Release every checkpoint and output still held. Used at engine
    /// teardown so `gc_state`/`gc_output` fire exactly once per handle.
    pub(crate) fn drain_gc(&mut self) {
        for c in self.checkpoints.drain(..) {
            if let Some(state) = c.state {
                self.model.gc_state(state);
            }
        }
        let mut retired: Vec<PinValue<X>> = self.good.drain(..).map(|(_, pv)| pv).collect();
        retired.extend(self.discard.drain(..).map(|(_, pv)| pv));
        if !retired.is_empty() {
            self.model.gc_output(retired);
        }
    }

    /// Tear the LP down and hand the model back.
    pub(crate) fn into_model(mut self) -> Box<dyn Atomic<X>> {
        self.drain_gc();
        self.model
    }

    #[cfg(test)]
    pub(crate) fn checkpoint_depth(&self) -> usize {
        self.checkpoints.len()
    }

    #[cfg(test)]
    pub(crate) fn queue_sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.avail.len(),
            self.used.len(),
            self.good.len(),
            self.discard.len(),
        )
    }

    #[cfg(test)]
    pub(crate) fn oldest_history(&self) -> Option<SuperDenseTime> {
        let mut oldest: Option<SuperDenseTime> = None;
        let mut fold = |t: SuperDenseTime| {
            if oldest.map_or(true, |o| t < o) {
                oldest = Some(t);
            }
        };
        if let Some(m) = self.used.front() {
            fold(m.t);
        }
        if let Some((t, _)) = self.discard.front() {
            fold(*t);
        }
        oldest
    }
}

/// Insert into a timestamp-ordered list, after any equal timestamps.
fn insert_message<X>(list: &mut VecDeque<Message<X>>, msg: Message<X>) {
    let pos = list.iter().rposition(|m| m.t <= msg.t).map_or(0, |p| p + 1);
    list.insert(pos, msg);
}

fn insert_output<X>(
    list: &mut VecDeque<(SuperDenseTime, PinValue<X>)>,
    rec: (SuperDenseTime, PinValue<X>),
) {
    let pos = list.iter().rposition(|(t, _)| *t <= rec.0).map_or(0, |p| p + 1);
    list.insert(pos, rec);
}
