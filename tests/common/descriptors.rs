use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use metashop::types::{Descriptor, ImageData, ProductId, TrainingEntry, DESCRIPTOR_BITS};

/// Extension used for images carrying raw descriptors for the fake extractor.
pub const RAW_EXTENSION: &str = "desc";

pub fn random_descriptor(rng: &mut StdRng) -> Descriptor {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    Descriptor(bytes)
}

/// `n` uniformly random descriptors. Independent random descriptors sit about
/// 128 bits apart.
pub fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| random_descriptor(&mut rng)).collect()
}

/// A copy of `d` with exactly `bits` distinct bits flipped.
pub fn perturb(d: &Descriptor, bits: usize, seed: u64) -> Descriptor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = *d;
    for bit in sample(&mut rng, DESCRIPTOR_BITS, bits) {
        out.0[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

/// One training entry per product, each with `per_product` random descriptors.
pub fn random_entries(products: &[ProductId], per_product: usize, seed: u64) -> Vec<TrainingEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    products
        .iter()
        .map(|&product_id| TrainingEntry {
            product_id,
            descriptors: (0..per_product).map(|_| random_descriptor(&mut rng)).collect(),
        })
        .collect()
}

/// Pack descriptors into an image payload understood by the fake extractor.
pub fn raw_image(descriptors: &[Descriptor]) -> ImageData {
    let data = descriptors.iter().flat_map(|d| d.0).collect();
    ImageData::new(data, RAW_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metashop::index::distance::hamming;

    #[test]
    fn test_perturb_flips_exact_bit_count() {
        let d = random_descriptors(1, 5)[0];
        assert_eq!(hamming(&d, &perturb(&d, 7, 1)), 7);
        assert_eq!(hamming(&d, &perturb(&d, 0, 1)), 0);
    }

    #[test]
    fn test_raw_image_length() {
        let image = raw_image(&random_descriptors(3, 1));
        assert_eq!(image.data.len(), 96);
        assert_eq!(image.extension, RAW_EXTENSION);
    }
}
