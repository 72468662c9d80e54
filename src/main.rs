use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use metashop::catalog::{
    fallback_image, Catalog, CatalogPriceLookup, DirImageStore, ImageStore, PriceLookup,
    SqliteCatalog,
};
use metashop::config::{Config, PublishMode};
use metashop::console::{run_console, spawn_line_reader, ConsoleExit};
use metashop::features::{BriefExtractor, FeatureExtractor};
use metashop::index::{EngineHandle, IndexCoordinator, MatchParams};
use metashop::ingest::{CatalogBuilder, ManifestEnricher};
use metashop::server::routes::build_router;
use metashop::server::{AdminState, ConnectionServer, SessionContext, SessionSettings};

#[tokio::main]
async fn main() {
    // Load .env
    let _ = dotenvy::dotenv();

    // Load config first (needed for logging setup)
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).expect("failed to load config");

    // Initialize tracing from LoggingConfig
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    tracing::info!("metashop starting");
    metashop::metrics::init();

    config
        .storage
        .create_directories()
        .expect("failed to create data directories");

    // Collaborators
    let catalog: Arc<dyn Catalog> = Arc::new(
        SqliteCatalog::open(&config.storage.catalog_path).expect("failed to open catalog"),
    );
    let images: Arc<dyn ImageStore> = Arc::new(
        DirImageStore::new(&config.storage.images_dir).expect("failed to open image store"),
    );
    let prices: Arc<dyn PriceLookup> = Arc::new(CatalogPriceLookup::new(
        catalog.clone(),
        config.prices.max_batch,
    ));
    let extractor: Arc<dyn FeatureExtractor> = Arc::new(BriefExtractor::new(&config.extraction));
    let fallback = Arc::new(fallback_image(&config.storage).expect("failed to load fallback image"));

    // Matching index
    let engine = Arc::new(EngineHandle::new());
    let coordinator = Arc::new(IndexCoordinator::new(
        engine.clone(),
        config.storage.index_dir.clone(),
        MatchParams::from(&config.indexing),
        config.indexing.publish_mode,
    ));
    match coordinator.load_persisted() {
        Ok(Some(id)) => tracing::info!(snapshot_id = %id, "serving persisted snapshot"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "persisted snapshot unusable, starting without an index"),
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if config.indexing.publish_mode == PublishMode::Deferred {
        coordinator
            .clone()
            .spawn_adoption_loop(config.indexing.adopt_interval(), shutdown_rx.clone());
    }

    let builder = Arc::new(CatalogBuilder::new(
        catalog.clone(),
        images.clone(),
        extractor.clone(),
        Arc::new(ManifestEnricher),
        coordinator.clone(),
    ));

    // Client-facing server
    let ctx = SessionContext {
        engine,
        extractor,
        catalog,
        images,
        prices,
        fallback_image: fallback,
        settings: SessionSettings::from(&config),
    };
    let server = ConnectionServer::bind(&config.server.addr(), ctx, config.server.shutdown_grace())
        .await
        .expect("failed to bind to address");
    tracing::info!(addr = %server.local_addr(), "listening");
    let accept_task = tokio::spawn(server.clone().run());

    // Admin HTTP surface
    let admin_task = if config.admin.enabled {
        let state = AdminState {
            coordinator: coordinator.clone(),
            builder: builder.clone(),
            config: Arc::new(config.clone()),
        };
        let app = build_router(state);
        let listener = TcpListener::bind(config.admin.addr())
            .await
            .expect("failed to bind admin address");
        tracing::info!(addr = %config.admin.addr(), "admin listening");
        let mut stop = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }))
    } else {
        None
    };

    // Console
    let console = config.server.console.then(|| {
        let builder = builder.clone();
        tokio::spawn(async move {
            let input = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
            run_console(input, tokio::io::stdout(), builder).await
        })
    });

    let exit_requested = async {
        match console {
            Some(task) => match task.await {
                Ok(Ok(ConsoleExit::Exit)) => return,
                Ok(Ok(ConsoleExit::InputClosed)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "console failed"),
                Err(e) => tracing::warn!(error = %e, "console task failed"),
            },
            None => {}
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = exit_requested => {}
    }

    // Signal shutdown to background tasks
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    server.shutdown().await;
    let _ = accept_task.await;
    if let Some(task) = admin_task {
        let _ = task.await;
    }
}
