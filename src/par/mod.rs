//! Conservative (lookahead-based) parallel simulation.
//!
//! Atomics are partitioned across logical processes connected by an
//! [`LpGraph`]; synchronization is by null messages and positive
//! lookahead, with no rollback. See [`ParSimulator`].

pub mod lp_graph;
pub mod simulator;

pub use lp_graph::LpGraph;
pub use simulator::ParSimulator;
