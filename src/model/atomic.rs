//! The `Atomic` trait — the contract every leaf model implements — and
//! the `MealyAtomic` extension for models whose output depends on input
//! at the same event.

use std::any::Any;

use super::id::Pin;

/// An output produced on a pin, or an input delivered through one.
///
/// Outputs carry the pin the model wrote to; delivered inputs carry the
/// terminal pin the value arrived on after routing. The engines treat
/// the value itself as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinValue<X> {
    /// The pin the value was produced on (output) or arrived at (input).
    pub pin: Pin,
    /// The user-defined payload.
    pub value: X,
}

impl<X> PinValue<X> {
    /// Convenience constructor.
    pub fn new(pin: Pin, value: X) -> Self {
        PinValue { pin, value }
    }
}

/// An opaque saved-state handle returned by [`Atomic::save_state`].
///
/// The engine never looks inside; it only stores the handle on a
/// checkpoint stack and hands it back to `restore_state` or `gc_state`.
pub type StateHandle = Box<dyn Any + Send>;

/// Trait implemented by every atomic (leaf) simulation component.
///
/// An atomic exposes a time advance `ta()` and the three DEVS state
/// transitions. The engine owns the model's event clock: it records the
/// last-event and next-event times itself and never mutates model state
/// outside calls to the methods below.
///
/// # Contract
///
/// Implementations **must**:
/// - Return `ta() >= 0` (`f64::INFINITY` passivates the model).
/// - Not read input inside `output_func` (Moore semantics; implement
///   [`MealyAtomic`] if output depends on same-event input).
/// - Not share mutable state with other atomics — under the parallel
///   engines each atomic is touched by exactly one worker at a time.
///
/// The state-saving methods default to "no observable state"; they are
/// only required for models run under the optimistic engine.
/// `lookahead` is only consulted by the conservative engine, which
/// requires it to be positive.
pub trait Atomic<X>: Send {
    /// Time to the next internal event from the current state.
    fn ta(&self) -> f64;

    /// Internal transition: the time advance expired with no input.
    fn delta_int(&mut self);

    /// External transition: input arrived `e` time units after the last
    /// event, before the time advance expired.
    fn delta_ext(&mut self, e: f64, inputs: &[PinValue<X>]);

    /// Confluent transition: the model is imminent *and* receiving input.
    fn delta_conf(&mut self, inputs: &[PinValue<X>]);

    /// Produce output at an internal event. Must not read input.
    fn output_func(&mut self, outputs: &mut Vec<PinValue<X>>);

    /// Save the current state for a possible rollback.
    ///
    /// `None` means "no observable state to checkpoint"; the engine will
    /// never attempt to restore from it.
    fn save_state(&mut self) -> Option<StateHandle> {
        None
    }

    /// Restore a state previously returned by `save_state`.
    fn restore_state(&mut self, _state: &StateHandle) {}

    /// Release a saved state. Called exactly once per handle, on commit,
    /// rollback, or engine teardown. The default drops it.
    fn gc_state(&mut self, _state: StateHandle) {}

    /// Release output values retired by commit or recalled by rollback.
    /// Called exactly once per produced value that the engine is done with.
    fn gc_output(&mut self, _outputs: Vec<PinValue<X>>) {}

    /// Minimum time between receiving an input and producing an output
    /// that depends on it. The conservative engine requires this to be
    /// positive; the other engines ignore it.
    fn lookahead(&self) -> f64 {
        0.0
    }

    /// Preferred logical process for the conservative engine, if any.
    fn processor_hint(&self) -> Option<usize> {
        None
    }

    /// Returns `true` if this model is a [`MealyAtomic`].
    fn is_mealy(&self) -> bool {
        false
    }

    /// Mealy extension discovery — the dyn-safe downcast the engines use
    /// at routing time. Mealy implementations return `Some(self)`.
    fn as_mealy(&mut self) -> Option<&mut dyn MealyAtomic<X>> {
        None
    }
}

/// Extension trait for models whose output depends on input received at
/// the same event.
///
/// The sequential engine computes Mealy outputs only after every Moore
/// output has been routed, and rejects feedback loops of Mealy models.
/// Implementations must override both [`Atomic::is_mealy`] (returning
/// `true`) and [`Atomic::as_mealy`] (returning `Some(self)`).
pub trait MealyAtomic<X>: Atomic<X> {
    /// Output at a confluent event: the model is imminent and `inputs`
    /// arrived at the same instant.
    fn confluent_output_func(&mut self, inputs: &[PinValue<X>], outputs: &mut Vec<PinValue<X>>);

    /// Output at an external event: `inputs` arrived `e` time units
    /// after the last event, before the model was imminent.
    fn external_output_func(&mut self, e: f64, inputs: &[PinValue<X>], outputs: &mut Vec<PinValue<X>>);
}
