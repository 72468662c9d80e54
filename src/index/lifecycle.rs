//! Ownership of the live matching snapshot and the rebuild state machine.
//!
//! Readers load the live snapshot through [`EngineHandle`] without ever taking
//! the coordinator lock. The lock guards only the rebuild state and the instant
//! of publication, so a build in progress never blocks queries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::PublishMode;
use crate::error::{MetashopError, Result};
use crate::index::engine::{MatchEngine, MatchParams};
use crate::types::{IndexAlgorithm, TrainingEntry};

/// Shared, atomically swappable reference to the snapshot serving queries.
#[derive(Default)]
pub struct EngineHandle {
    live: ArcSwapOption<MatchEngine>,
}

impl EngineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: MatchEngine) -> Self {
        Self {
            live: ArcSwapOption::from_pointee(engine),
        }
    }

    /// The snapshot a query should run against, held for that query only.
    pub fn current(&self) -> Option<Arc<MatchEngine>> {
        self.live.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.live.load().is_some()
    }

    /// Replace the live snapshot, returning the previous one.
    pub fn publish(&self, engine: Arc<MatchEngine>) -> Option<Arc<MatchEngine>> {
        self.live.swap(Some(engine))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildState {
    Idle,
    Building,
    /// A snapshot is built and waiting for the adoption loop.
    ReadyToPublish,
}

enum Stage {
    Idle,
    Building,
    ReadyToPublish(Arc<MatchEngine>),
}

impl Stage {
    fn state(&self) -> RebuildState {
        match self {
            Stage::Idle => RebuildState::Idle,
            Stage::Building => RebuildState::Building,
            Stage::ReadyToPublish(_) => RebuildState::ReadyToPublish,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub built_at: DateTime<Utc>,
    pub descriptors: usize,
    pub products: usize,
    pub algorithm: IndexAlgorithm,
}

impl SnapshotInfo {
    fn of(engine: &MatchEngine) -> Self {
        Self {
            snapshot_id: engine.id().to_string(),
            built_at: engine.built_at(),
            descriptors: engine.len(),
            products: engine.product_count(),
            algorithm: engine.algorithm(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: RebuildState,
    pub publish_mode: PublishMode,
    pub live: Option<SnapshotInfo>,
    pub pending: Option<SnapshotInfo>,
}

/// What a finished rebuild did with its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    Published { snapshot_id: Ulid, persisted: bool },
    /// Parked until [`IndexCoordinator::adopt_pending`] publishes it.
    Pending { snapshot_id: Ulid },
}

impl RebuildOutcome {
    pub fn snapshot_id(&self) -> Ulid {
        match self {
            RebuildOutcome::Published { snapshot_id, .. }
            | RebuildOutcome::Pending { snapshot_id } => *snapshot_id,
        }
    }
}

pub struct IndexCoordinator {
    handle: Arc<EngineHandle>,
    stage: Mutex<Stage>,
    index_dir: PathBuf,
    params: MatchParams,
    mode: PublishMode,
}

impl IndexCoordinator {
    pub fn new(
        handle: Arc<EngineHandle>,
        index_dir: PathBuf,
        params: MatchParams,
        mode: PublishMode,
    ) -> Self {
        Self {
            handle,
            stage: Mutex::new(Stage::Idle),
            index_dir,
            params,
            mode,
        }
    }

    pub fn handle(&self) -> &Arc<EngineHandle> {
        &self.handle
    }

    pub fn params(&self) -> MatchParams {
        self.params
    }

    pub fn state(&self) -> RebuildState {
        self.stage.lock().state()
    }

    /// Reserve the single rebuild slot. Fails with `RebuildInProgress` while a
    /// build is running or a built snapshot still awaits adoption.
    pub fn begin_build(self: &Arc<Self>) -> Result<BuildTicket> {
        let mut stage = self.stage.lock();
        if !matches!(*stage, Stage::Idle) {
            return Err(MetashopError::RebuildInProgress);
        }
        *stage = Stage::Building;
        Ok(BuildTicket {
            coordinator: Arc::clone(self),
            finished: false,
        })
    }

    /// Build a snapshot from `entries` and publish it according to the
    /// publish mode. CPU bound; async callers run it on the blocking pool.
    pub fn rebuild(self: &Arc<Self>, entries: &[TrainingEntry]) -> Result<RebuildOutcome> {
        self.begin_build()?.finish(entries)
    }

    /// Publish a snapshot parked by a deferred rebuild. Never waits for the
    /// lock: if another context holds it, adoption is left for the next call.
    pub fn adopt_pending(&self) -> Option<Ulid> {
        let mut stage = self.stage.try_lock()?;
        let engine = match std::mem::replace(&mut *stage, Stage::Idle) {
            Stage::ReadyToPublish(engine) => engine,
            other => {
                *stage = other;
                return None;
            }
        };
        let id = engine.id();
        self.publish_locked(engine);
        Some(id)
    }

    /// Publish the snapshot persisted in the index directory, if any.
    pub fn load_persisted(&self) -> Result<Option<Ulid>> {
        let Some(engine) = MatchEngine::load(&self.index_dir, self.params)? else {
            info!(dir = %self.index_dir.display(), "no persisted snapshot, starting without an index");
            return Ok(None);
        };
        let id = engine.id();
        let _stage = self.stage.lock();
        self.handle.publish(Arc::new(engine));
        Ok(Some(id))
    }

    pub fn status(&self) -> CoordinatorStatus {
        let (state, pending) = {
            let stage = self.stage.lock();
            let pending = match &*stage {
                Stage::ReadyToPublish(engine) => Some(SnapshotInfo::of(engine)),
                _ => None,
            };
            (stage.state(), pending)
        };
        CoordinatorStatus {
            state,
            publish_mode: self.mode,
            live: self.handle.current().map(|e| SnapshotInfo::of(&e)),
            pending,
        }
    }

    /// Periodically adopt deferred snapshots until `shutdown` flips to true.
    pub fn spawn_adoption_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(id) = self.adopt_pending() {
                            info!(snapshot_id = %id, "adopted pending snapshot");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("adoption loop shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Swap the live handle and persist. Caller holds the stage lock.
    fn publish_locked(&self, engine: Arc<MatchEngine>) -> bool {
        let id = engine.id();
        self.handle.publish(Arc::clone(&engine));
        crate::metrics::REBUILDS_TOTAL
            .with_label_values(&["published"])
            .inc();
        match engine.persist(&self.index_dir) {
            Ok(path) => {
                info!(snapshot_id = %id, path = %path.display(), "published snapshot");
                true
            }
            Err(e) => {
                error!(snapshot_id = %id, error = %e, "published snapshot but failed to persist it");
                false
            }
        }
    }
}

/// Exclusive right to run one rebuild. Dropping it unfinished returns the
/// coordinator to `Idle`.
pub struct BuildTicket {
    coordinator: Arc<IndexCoordinator>,
    finished: bool,
}

impl BuildTicket {
    pub fn finish(mut self, entries: &[TrainingEntry]) -> Result<RebuildOutcome> {
        let engine = match MatchEngine::build(entries, self.coordinator.params) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                crate::metrics::REBUILDS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                warn!(error = %e, "rebuild failed, live snapshot unchanged");
                return Err(e);
            }
        };
        let snapshot_id = engine.id();

        let coordinator = Arc::clone(&self.coordinator);
        let mut stage = coordinator.stage.lock();
        self.finished = true;
        match coordinator.mode {
            PublishMode::Immediate => {
                *stage = Stage::Idle;
                let persisted = coordinator.publish_locked(engine);
                Ok(RebuildOutcome::Published {
                    snapshot_id,
                    persisted,
                })
            }
            PublishMode::Deferred => {
                *stage = Stage::ReadyToPublish(engine);
                crate::metrics::REBUILDS_TOTAL
                    .with_label_values(&["pending"])
                    .inc();
                info!(snapshot_id = %snapshot_id, "snapshot built, awaiting adoption");
                Ok(RebuildOutcome::Pending { snapshot_id })
            }
        }
    }
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        if !self.finished {
            let mut stage = self.coordinator.stage.lock();
            if matches!(*stage, Stage::Building) {
                *stage = Stage::Idle;
            }
        }
    }
}
