pub mod handlers;
pub mod listener;
pub mod routes;
pub mod session;

use std::sync::Arc;

use crate::config::Config;
use crate::index::IndexCoordinator;
use crate::ingest::CatalogBuilder;

pub use listener::ConnectionServer;
pub use session::{run_session, SessionContext, SessionEnd, SessionSettings};

/// Shared state injected into the admin handlers via axum's State extractor.
#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<IndexCoordinator>,
    pub builder: Arc<CatalogBuilder>,
    pub config: Arc<Config>,
}
