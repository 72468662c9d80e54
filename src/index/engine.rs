use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::IndexingConfig;
use crate::error::{MetashopError, Result};
use crate::index::distance::passes_ratio_test;
use crate::index::linear::LinearScan;
use crate::index::lsh::{LshIndex, LshParams};
use crate::index::traits::NeighborIndex;
use crate::types::{
    Descriptor, IndexAlgorithm, MatchCandidate, ProductId, QueryOutcome, TrainingEntry,
};

/// File name of the persisted snapshot inside the index directory.
pub const SNAPSHOT_FILE: &str = "matcher.bin";

const FORMAT_VERSION: u32 = 1;

/// Parameters shared by build, load and query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    pub algorithm: IndexAlgorithm,
    pub lsh: LshParams,
    pub ratio_threshold: f32,
    pub top_k: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for MatchParams {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            algorithm: config.algorithm,
            lsh: LshParams::from(config),
            ratio_threshold: config.ratio_threshold,
            top_k: config.top_k,
        }
    }
}

/// On-disk record. The search structure is rebuilt on load, never stored.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u32,
    snapshot_id: u128,
    built_at_ms: i64,
    descriptors: Vec<Descriptor>,
    owners: Vec<ProductId>,
    checksum: u64,
}

impl SnapshotFile {
    fn compute_checksum(descriptors: &[Descriptor], owners: &[ProductId]) -> Result<u64> {
        let payload = bincode::serialize(&(descriptors, owners))?;
        Ok(xxh3_64(&payload))
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(MetashopError::SnapshotFormat(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.descriptors.len() != self.owners.len() {
            return Err(MetashopError::SnapshotFormat(format!(
                "{} descriptors but {} owners",
                self.descriptors.len(),
                self.owners.len()
            )));
        }
        let expected = Self::compute_checksum(&self.descriptors, &self.owners)?;
        if self.checksum != expected {
            return Err(MetashopError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }
}

/// An immutable matching snapshot: every catalogued descriptor, the product
/// that owns it, and a search structure over them.
///
/// A `MatchEngine` only exists once built or loaded, so there is no
/// "query before build" state to guard against.
pub struct MatchEngine {
    id: Ulid,
    built_at: DateTime<Utc>,
    descriptors: Vec<Descriptor>,
    owners: Vec<ProductId>,
    structure: Box<dyn NeighborIndex>,
    params: MatchParams,
}

impl std::fmt::Debug for MatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchEngine")
            .field("id", &self.id)
            .field("descriptors", &self.descriptors.len())
            .field("algorithm", &self.structure.algorithm())
            .finish()
    }
}

impl MatchEngine {
    /// Concatenate all entry descriptors in order and build the search structure.
    /// Entries without descriptors are skipped; an all-empty input is an error.
    #[instrument(skip(entries, params), fields(entries = entries.len()))]
    pub fn build(entries: &[TrainingEntry], params: MatchParams) -> Result<Self> {
        let total: usize = entries.iter().map(|e| e.descriptors.len()).sum();
        let mut descriptors = Vec::with_capacity(total);
        let mut owners = Vec::with_capacity(total);

        for entry in entries {
            if entry.descriptors.is_empty() {
                warn!(product_id = entry.product_id, "no descriptors for product, skipping");
                continue;
            }
            descriptors.extend_from_slice(&entry.descriptors);
            owners.extend(std::iter::repeat(entry.product_id).take(entry.descriptors.len()));
        }

        if descriptors.is_empty() {
            return Err(MetashopError::Index(
                "no training entry produced any descriptors".to_string(),
            ));
        }

        let engine = Self::assemble(Ulid::new(), Utc::now(), descriptors, owners, params);
        info!(
            snapshot_id = %engine.id,
            descriptors = engine.len(),
            products = engine.product_count(),
            algorithm = %params.algorithm,
            "built matching snapshot"
        );
        Ok(engine)
    }

    fn assemble(
        id: Ulid,
        built_at: DateTime<Utc>,
        descriptors: Vec<Descriptor>,
        owners: Vec<ProductId>,
        params: MatchParams,
    ) -> Self {
        let structure: Box<dyn NeighborIndex> = match params.algorithm {
            IndexAlgorithm::Linear => Box::new(LinearScan),
            IndexAlgorithm::Lsh => Box::new(LshIndex::build(&descriptors, params.lsh)),
        };
        Self {
            id,
            built_at,
            descriptors,
            owners,
            structure,
            params,
        }
    }

    pub fn snapshot_path(dir: &Path) -> PathBuf {
        dir.join(SNAPSHOT_FILE)
    }

    /// Serialize descriptors and owners to `<dir>/matcher.bin`, via a temp file
    /// and rename so readers never see a partial snapshot.
    #[instrument(skip(self), fields(snapshot_id = %self.id))]
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let file = SnapshotFile {
            format_version: FORMAT_VERSION,
            snapshot_id: self.id.0,
            built_at_ms: self.built_at.timestamp_millis(),
            checksum: SnapshotFile::compute_checksum(&self.descriptors, &self.owners)?,
            descriptors: self.descriptors.clone(),
            owners: self.owners.clone(),
        };
        let data = bincode::serialize(&file)?;

        let path = Self::snapshot_path(dir);
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.{}.tmp", self.id));
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;

        debug!(bytes = data.len(), path = %path.display(), "persisted snapshot");
        Ok(path)
    }

    /// Load a persisted snapshot and rebuild its search structure with `params`.
    /// Returns `Ok(None)` when no snapshot has been written yet.
    #[instrument(skip(params))]
    pub fn load(dir: &Path, params: MatchParams) -> Result<Option<Self>> {
        let path = Self::snapshot_path(dir);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: SnapshotFile = bincode::deserialize(&data)?;
        file.validate()?;

        let built_at = Utc
            .timestamp_millis_opt(file.built_at_ms)
            .single()
            .ok_or_else(|| {
                MetashopError::SnapshotFormat(format!("invalid build time {}", file.built_at_ms))
            })?;

        let engine = Self::assemble(
            Ulid(file.snapshot_id),
            built_at,
            file.descriptors,
            file.owners,
            params,
        );
        info!(
            snapshot_id = %engine.id,
            descriptors = engine.len(),
            "loaded persisted snapshot"
        );
        Ok(Some(engine))
    }

    /// Rank products for a query image using the configured `top_k`.
    pub fn query(&self, query: &[Descriptor]) -> QueryOutcome {
        self.query_top(query, self.params.top_k)
    }

    /// Each query descriptor that passes the ratio test votes for the owner of
    /// its nearest neighbour. Products are ranked by votes, ties keeping the
    /// order in which products first received a vote.
    pub fn query_top(&self, query: &[Descriptor], k: usize) -> QueryOutcome {
        if query.is_empty() {
            return QueryOutcome::NoDescriptors;
        }

        let mut tally: Vec<MatchCandidate> = Vec::new();
        let mut slots: HashMap<ProductId, usize> = HashMap::new();
        let mut accepted = 0usize;

        for descriptor in query {
            let neighbors = self.structure.knn(&self.descriptors, descriptor, 2);
            let [nearest, second] = match neighbors.as_slice() {
                [a, b, ..] => [*a, *b],
                _ => continue,
            };
            if !passes_ratio_test(nearest.distance, second.distance, self.params.ratio_threshold)
            {
                continue;
            }
            accepted += 1;

            let owner = self.owners[nearest.index];
            let slot = *slots.entry(owner).or_insert_with(|| {
                tally.push(MatchCandidate {
                    product_id: owner,
                    vote_count: 0,
                });
                tally.len() - 1
            });
            tally[slot].vote_count += 1;
        }

        // Stable sort keeps first-vote order among equal counts.
        tally.sort_by(|a, b| b.vote_count.cmp(&a.vote_count));
        tally.truncate(k);

        debug!(
            query_descriptors = query.len(),
            accepted,
            candidates = tally.len(),
            "matched query descriptors"
        );
        QueryOutcome::Ranked(tally)
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn owners(&self) -> &[ProductId] {
        &self.owners
    }

    pub fn product_count(&self) -> usize {
        let mut ids: Vec<ProductId> = self.owners.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn algorithm(&self) -> IndexAlgorithm {
        self.structure.algorithm()
    }
}
