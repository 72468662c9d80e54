use crate::index::distance::{hamming, select_nearest, Neighbor};
use crate::index::traits::NeighborIndex;
use crate::types::{Descriptor, IndexAlgorithm};

/// Exhaustive scan. Exact, and the reference the LSH structure falls back to.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScan;

impl LinearScan {
    pub fn scan(descriptors: &[Descriptor], query: &Descriptor, k: usize) -> Vec<Neighbor> {
        select_nearest(
            descriptors.iter().enumerate().map(|(index, d)| Neighbor {
                distance: hamming(d, query),
                index,
            }),
            k,
        )
    }
}

impl NeighborIndex for LinearScan {
    fn knn(&self, descriptors: &[Descriptor], query: &Descriptor, k: usize) -> Vec<Neighbor> {
        Self::scan(descriptors, query, k)
    }

    fn algorithm(&self) -> IndexAlgorithm {
        IndexAlgorithm::Linear
    }
}
