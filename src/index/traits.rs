//! Core trait for nearest-neighbour search structures.
//!
//! A matching snapshot owns its descriptors; the search structure is derived
//! data built over them, so every implementation receives the descriptor slice
//! it was built from at query time.

use crate::index::distance::Neighbor;
use crate::types::{Descriptor, IndexAlgorithm};

/// Trait that every neighbour search structure must satisfy.
///
/// Object safe so a snapshot can hold a `Box<dyn NeighborIndex>` when the
/// algorithm is chosen from configuration.
pub trait NeighborIndex: Send + Sync {
    /// Return up to `k` neighbours of `query` among `descriptors`, ordered by
    /// ascending Hamming distance and then by position.
    ///
    /// # Arguments
    /// * `descriptors` - The exact slice the structure was built over.
    /// * `query`       - The descriptor to search for.
    /// * `k`           - Maximum number of neighbours returned.
    fn knn(&self, descriptors: &[Descriptor], query: &Descriptor, k: usize) -> Vec<Neighbor>;

    /// Which algorithm this structure implements.
    fn algorithm(&self) -> IndexAlgorithm;
}
