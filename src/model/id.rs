//! Atomic and pin identifiers — lightweight, ordered, copyable handles.

/// A unique identifier for an atomic model registered in a [`Graph`].
///
/// `AtomicId` is a newtype around `u64` rather than a bare integer to
/// prevent accidental confusion with other `u64` values (pins, ordinals)
/// at compile time. Ids are minted by the graph and index into its slab;
/// they are never reused within one graph.
///
/// [`Graph`]: crate::graph::Graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AtomicId(u64);

impl AtomicId {
    /// Create an atomic ID from a raw integer.
    #[inline]
    pub fn new(id: u64) -> Self {
        AtomicId(id)
    }

    /// Return the underlying integer.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// The slab index this ID denotes.
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for AtomicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// A named coupling point.
///
/// Pins are the vertices of the coupling relation: outputs are produced
/// on a pin, flow along pin→pin edges, and arrive at atomics through
/// pin→atomic edges. Minted by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Pin(u64);

impl Pin {
    /// Create a pin from a raw integer.
    #[inline]
    pub fn new(id: u64) -> Self {
        Pin(id)
    }

    /// Return the underlying integer.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}
