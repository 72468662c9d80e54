//! Hamming distance and nearest-neighbour selection over binary descriptors.

use crate::types::Descriptor;

/// A neighbour of a query descriptor: position in the snapshot plus distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Neighbor {
    // Field order gives (distance, index) ordering: closer first, then lower position.
    pub distance: u32,
    pub index: usize,
}

/// Number of differing bits between two descriptors.
#[inline]
pub fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    let mut total = 0u32;
    for (x, y) in a.0.chunks_exact(8).zip(b.0.chunks_exact(8)) {
        let mut wa = [0u8; 8];
        let mut wb = [0u8; 8];
        wa.copy_from_slice(x);
        wb.copy_from_slice(y);
        total += (u64::from_le_bytes(wa) ^ u64::from_le_bytes(wb)).count_ones();
    }
    total
}

/// Lowe's ratio test: accept the nearest neighbour only when it is clearly
/// closer than the second nearest.
#[inline]
pub fn passes_ratio_test(nearest: u32, second: u32, ratio: f32) -> bool {
    (nearest as f32) < ratio * second as f32
}

/// Keep the `k` smallest neighbours from `candidates`, ordered by
/// `(distance, index)`.
pub fn select_nearest<I>(candidates: I, k: usize) -> Vec<Neighbor>
where
    I: IntoIterator<Item = Neighbor>,
{
    if k == 0 {
        return Vec::new();
    }
    let mut best: Vec<Neighbor> = Vec::with_capacity(k + 1);
    for candidate in candidates {
        if best.len() == k && candidate >= best[k - 1] {
            continue;
        }
        let pos = best.partition_point(|n| *n < candidate);
        best.insert(pos, candidate);
        best.truncate(k);
    }
    best
}
