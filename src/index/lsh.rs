//! Bit-sampling locality-sensitive hashing for binary descriptors.
//!
//! Each table hashes a descriptor to the concatenation of `key_bits` sampled bit
//! positions. Descriptors close in Hamming distance agree on most sampled bits,
//! so they tend to share a bucket in at least one table. Multi-probe visits the
//! buckets within `multi_probe_level` bit flips of the query key as well.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::IndexingConfig;
use crate::index::distance::{hamming, select_nearest, Neighbor};
use crate::index::linear::LinearScan;
use crate::index::traits::NeighborIndex;
use crate::types::{Descriptor, IndexAlgorithm, DESCRIPTOR_BITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshParams {
    pub tables: usize,
    pub key_bits: usize,
    pub multi_probe_level: usize,
    pub seed: u64,
}

impl Default for LshParams {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for LshParams {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            tables: config.lsh_tables,
            key_bits: config.lsh_key_bits,
            multi_probe_level: config.lsh_multi_probe_level,
            seed: config.lsh_seed,
        }
    }
}

struct HashTable {
    bits: Vec<usize>,
    buckets: HashMap<u32, Vec<u32>>,
}

impl HashTable {
    fn key(&self, descriptor: &Descriptor) -> u32 {
        self.bits
            .iter()
            .enumerate()
            .fold(0u32, |key, (i, &bit)| key | (u32::from(descriptor.bit(bit)) << i))
    }
}

pub struct LshIndex {
    params: LshParams,
    tables: Vec<HashTable>,
}

impl LshIndex {
    /// Hash every descriptor into every table. Same seed and parameters give
    /// the same tables.
    pub fn build(descriptors: &[Descriptor], params: LshParams) -> Self {
        let key_bits = params.key_bits.clamp(1, 32.min(DESCRIPTOR_BITS));
        let mut rng = StdRng::seed_from_u64(params.seed);

        let mut tables = Vec::with_capacity(params.tables.max(1));
        for _ in 0..params.tables.max(1) {
            let bits = rand::seq::index::sample(&mut rng, DESCRIPTOR_BITS, key_bits).into_vec();
            let mut table = HashTable {
                bits,
                buckets: HashMap::new(),
            };
            for (position, descriptor) in descriptors.iter().enumerate() {
                let key = table.key(descriptor);
                table.buckets.entry(key).or_default().push(position as u32);
            }
            tables.push(table);
        }

        debug!(
            tables = tables.len(),
            key_bits,
            descriptors = descriptors.len(),
            "built lsh tables"
        );

        Self { params, tables }
    }

    /// Positions sharing a probed bucket with `query` in any table.
    fn candidates(&self, query: &Descriptor) -> HashSet<u32> {
        let mut found = HashSet::new();
        for table in &self.tables {
            let key = table.key(query);
            for probe in probe_keys(key, table.bits.len(), self.params.multi_probe_level) {
                if let Some(bucket) = table.buckets.get(&probe) {
                    found.extend(bucket.iter().copied());
                }
            }
        }
        found
    }
}

impl NeighborIndex for LshIndex {
    fn knn(&self, descriptors: &[Descriptor], query: &Descriptor, k: usize) -> Vec<Neighbor> {
        let candidates = self.candidates(query);

        // Too few colliding descriptors to rank k of them; scan everything.
        if candidates.len() < k && descriptors.len() > candidates.len() {
            return LinearScan::scan(descriptors, query, k);
        }

        select_nearest(
            candidates.into_iter().filter_map(|position| {
                let index = position as usize;
                descriptors.get(index).map(|d| Neighbor {
                    distance: hamming(d, query),
                    index,
                })
            }),
            k,
        )
    }

    fn algorithm(&self) -> IndexAlgorithm {
        IndexAlgorithm::Lsh
    }
}

/// The query key plus every key within `level` bit flips of it.
fn probe_keys(key: u32, width: usize, level: usize) -> Vec<u32> {
    let mut keys = vec![key];
    if level >= 1 {
        for i in 0..width {
            keys.push(key ^ (1 << i));
        }
    }
    if level >= 2 {
        for i in 0..width {
            for j in (i + 1)..width {
                keys.push(key ^ (1 << i) ^ (1 << j));
            }
        }
    }
    keys
}
