//! Structured error types for the simulation kernel.
//!
//! All fallible public APIs return `Result<T, KairosError>`. Every DEVS
//! contract violation is fatal: the current simulation call terminates
//! and the caller may drop the simulator and the model tree. The variant
//! carries the offending model where one exists so callers can report
//! which component misbehaved without relying on stringly-typed errors.

use crate::model::{AtomicId, Pin};

/// The top-level error type for the simulation kernel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum KairosError {
    // ── Model contract violations ─────────────────────────

    /// An atomic's `ta()` returned a value less than zero.
    NegativeTimeAdvance { atomic: AtomicId, dt: f64 },

    /// Routing produced a message from an atomic back to itself at the
    /// same event.
    SelfInfluence { atomic: AtomicId, pin: Pin },

    /// Routing delivered input to a Mealy atomic whose output was
    /// already computed this event.
    MealyFeedbackLoop { atomic: AtomicId },

    // ── Structural preconditions ──────────────────────────

    /// A pin was referenced but is not part of the graph.
    UnknownPin(Pin),

    /// An atomic was referenced but is not part of the graph.
    UnknownAtomic(AtomicId),

    // ── Conservative engine preconditions ─────────────────

    /// An atomic offered to the conservative engine has no positive
    /// lookahead; without one the null-message scheme deadlocks.
    NonPositiveLookahead { atomic: AtomicId, lookahead: f64 },

    /// Mealy atomics cannot be simulated by the parallel engines.
    MealyUnsupported { atomic: AtomicId },

    /// An event had to cross between two logical processes that the
    /// provided LP coupling graph does not connect.
    MissingLpEdge { from: usize, to: usize },
}

impl std::fmt::Display for KairosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KairosError::NegativeTimeAdvance { atomic, dt } => {
                write!(f, "atomic {} returned negative time advance {}", atomic, dt)
            }
            KairosError::SelfInfluence { atomic, pin } => {
                write!(f, "atomic {} tried to influence itself via pin {}", atomic, pin)
            }
            KairosError::MealyFeedbackLoop { atomic } => {
                write!(f, "feedback loop of Mealy models is illegal (atomic {})", atomic)
            }
            KairosError::UnknownPin(pin) => write!(f, "pin {} is not in the graph", pin),
            KairosError::UnknownAtomic(id) => {
                write!(f, "atomic {} is not in the graph", id)
            }
            KairosError::NonPositiveLookahead { atomic, lookahead } => write!(
                f,
                "atomic {} has lookahead {} but the conservative engine requires a positive lookahead",
                atomic, lookahead
            ),
            KairosError::MealyUnsupported { atomic } => write!(
                f,
                "atomic {} is a Mealy model, which the parallel engines do not support",
                atomic
            ),
            KairosError::MissingLpEdge { from, to } => write!(
                f,
                "no edge from logical process {} to {} in the LP coupling graph",
                from, to
            ),
        }
    }
}

impl std::error::Error for KairosError {}

/// Convenience alias for `Result<T, KairosError>`.
pub type KairosResult<T> = Result<T, KairosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_negative_time_advance() {
        let e = KairosError::NegativeTimeAdvance {
            atomic: AtomicId::new(3),
            dt: -0.5,
        };
        assert_eq!(e.to_string(), "atomic A3 returned negative time advance -0.5");
    }

    #[test]
    fn test_display_mealy_feedback() {
        let e = KairosError::MealyFeedbackLoop {
            atomic: AtomicId::new(1),
        };
        assert!(e.to_string().contains("feedback loop of Mealy models"));
    }

    #[test]
    fn test_display_unknown_pin() {
        let e = KairosError::UnknownPin(Pin::new(9));
        assert_eq!(e.to_string(), "pin P9 is not in the graph");
    }

    #[test]
    fn test_error_is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(KairosError::UnknownAtomic(AtomicId::new(0)));
        assert!(!e.to_string().is_empty());
    }

    #[test]
    fn test_result_alias() {
        let ok: KairosResult<u32> = Ok(7);
        let err: KairosResult<u32> = Err(KairosError::UnknownPin(Pin::new(1)));
        assert_eq!(ok.unwrap(), 7);
        assert!(err.is_err());
    }
}
