//! Coupling graph over logical processes for the conservative engine.

use std::collections::BTreeSet;

/// Directed graph whose edges say which logical processes feed input to
/// which others. An LP only waits on the neighbors that can actually
/// reach it, so a sparse graph buys parallelism.
///
/// The default coupling is all-to-all: safe for any model, and the
/// right choice when the cross-LP traffic pattern is unknown.
#[derive(Debug, Clone, Default)]
pub struct LpGraph {
    edges: BTreeSet<(usize, usize)>,
}

impl LpGraph {
    /// Create a graph with no edges.
    pub fn new() -> Self {
        LpGraph {
            edges: BTreeSet::new(),
        }
    }

    /// Create the complete coupling over `n` logical processes.
    pub fn all_to_all(n: usize) -> Self {
        let mut g = LpGraph::new();
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    g.add_edge(i, j);
                }
            }
        }
        g
    }

    /// Declare that process `from` feeds input to process `to`.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        if from != to {
            self.edges.insert((from, to));
        }
    }

    /// Returns `true` if `from` feeds `to`.
    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.edges.contains(&(from, to))
    }

    /// The processes feeding input to `lp`.
    pub fn incoming(&self, lp: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == lp)
            .map(|(from, _)| *from)
            .collect()
    }

    /// The processes `lp` feeds input to.
    pub fn outgoing(&self, lp: usize) -> Vec<usize> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == lp)
            .map(|(_, to)| *to)
            .collect()
    }
}
