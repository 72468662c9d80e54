//! Descriptor matching: neighbour search structures, the snapshot engine and
//! its lifecycle.

pub mod distance;
pub mod engine;
pub mod lifecycle;
pub mod linear;
pub mod lsh;
pub mod traits;

pub use engine::{MatchEngine, MatchParams};
pub use lifecycle::{EngineHandle, IndexCoordinator, RebuildOutcome, RebuildState};
pub use traits::NeighborIndex;
