//! Model-facing types: identifiers, pin values, and the atomic-model
//! traits the engines consume.

pub mod atomic;
pub mod id;

pub use atomic::{Atomic, MealyAtomic, PinValue, StateHandle};
pub use id::{AtomicId, Pin};
