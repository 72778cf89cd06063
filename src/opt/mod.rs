//! Optimistic (Time-Warp) parallel simulation.
//!
//! One logical process per atomic model, speculative execution,
//! rollback via anti-messages, and fossil collection at global virtual
//! time. See [`OptSimulator`] for the executive and the model
//! requirements.

pub mod message;
pub mod simulator;

pub(crate) mod lp;

pub use message::{Message, MessageKind};
pub use simulator::OptSimulator;
