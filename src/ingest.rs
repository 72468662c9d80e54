//! Offline catalog build: product list file to catalog rows, canonical images
//! and a rebuilt matching snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::catalog::images::read_image_file;
use crate::catalog::{Catalog, ImageStore};
use crate::error::{MetashopError, Result};
use crate::features::FeatureExtractor;
use crate::index::lifecycle::{BuildTicket, IndexCoordinator, RebuildOutcome};
use crate::types::{ImageData, TrainingEntry};

/// One line of a product file:
/// `name[<TAB>walmart_sku[<TAB>amazon_asin[<TAB>image_path[<TAB>walmart_price[<TAB>amazon_price]]]]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductListing {
    pub name: String,
    pub walmart_sku: Option<String>,
    pub amazon_asin: Option<String>,
    pub image_path: Option<PathBuf>,
    pub walmart_price: Option<f64>,
    pub amazon_price: Option<f64>,
}

/// Parse a product file. Blank lines and `#` comments are skipped; relative
/// image paths resolve against `base_dir`.
pub fn parse_product_file(content: &str, base_dir: &Path) -> Vec<ProductListing> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|line| {
            let mut fields = line.split('\t').map(str::trim);
            let name = fields.next().unwrap_or_default().to_string();
            let mut text = || {
                fields
                    .next()
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
            };
            let walmart_sku = text();
            let amazon_asin = text();
            let image_path = text().map(|p| {
                let path = PathBuf::from(p);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            });
            let walmart_price = text().and_then(|p| p.parse().ok());
            let amazon_price = text().and_then(|p| p.parse().ok());
            ProductListing {
                name,
                walmart_sku,
                amazon_asin,
                image_path,
                walmart_price,
                amazon_price,
            }
        })
        .filter(|listing| !listing.name.is_empty())
        .collect()
}

/// What enrichment learned about a product.
#[derive(Debug, Clone)]
pub struct EnrichedProduct {
    pub walmart_sku: String,
    pub amazon_asin: String,
    pub image: ImageData,
    pub walmart_price: Option<f64>,
    pub amazon_price: Option<f64>,
}

/// Looks up retailer identifiers, prices and a canonical image for a listing.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, listing: &ProductListing) -> Result<EnrichedProduct>;
}

/// Takes everything from the listing itself and reads the named image file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestEnricher;

#[async_trait]
impl Enricher for ManifestEnricher {
    async fn enrich(&self, listing: &ProductListing) -> Result<EnrichedProduct> {
        let path = listing.image_path.clone().ok_or_else(|| {
            MetashopError::Enrichment(format!("no image given for '{}'", listing.name))
        })?;
        let image = tokio::task::spawn_blocking(move || read_image_file(&path))
            .await
            .map_err(|e| MetashopError::Internal(format!("image read task failed: {e}")))??;
        Ok(EnrichedProduct {
            walmart_sku: listing.walmart_sku.clone().unwrap_or_default(),
            amazon_asin: listing.amazon_asin.clone().unwrap_or_default(),
            image,
            walmart_price: listing.walmart_price,
            amazon_price: listing.amazon_price,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub added: Vec<String>,
    pub already_catalogued: usize,
    pub failed: Vec<FailedProduct>,
    pub training_entries: usize,
    pub snapshot_id: Option<String>,
    /// False when the rebuilt snapshot is parked for deferred adoption.
    pub published: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedProduct {
    pub name: String,
    pub reason: String,
}

impl BuildReport {
    /// Nothing new was added, so no rebuild ran.
    pub fn catalog_current(&self) -> bool {
        self.snapshot_id.is_none()
    }

    fn record(&mut self, outcome: &RebuildOutcome) {
        self.snapshot_id = Some(outcome.snapshot_id().to_string());
        self.published = matches!(outcome, RebuildOutcome::Published { .. });
    }
}

pub struct CatalogBuilder {
    catalog: Arc<dyn Catalog>,
    images: Arc<dyn ImageStore>,
    extractor: Arc<dyn FeatureExtractor>,
    enricher: Arc<dyn Enricher>,
    coordinator: Arc<IndexCoordinator>,
}

impl CatalogBuilder {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        images: Arc<dyn ImageStore>,
        extractor: Arc<dyn FeatureExtractor>,
        enricher: Arc<dyn Enricher>,
        coordinator: Arc<IndexCoordinator>,
    ) -> Self {
        Self {
            catalog,
            images,
            extractor,
            enricher,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<IndexCoordinator> {
        &self.coordinator
    }

    /// Catalogue every product in `path` not already known, then rebuild the
    /// index from all stored images. Per-product failures are skipped.
    pub async fn build_from_file(&self, path: &Path) -> Result<BuildReport> {
        let ticket = self.coordinator.begin_build()?;
        self.build_from_file_with(ticket, path).await
    }

    /// [`build_from_file`](Self::build_from_file) with the rebuild slot
    /// already reserved by the caller.
    #[instrument(skip(self, ticket), fields(path = %path.display()))]
    pub async fn build_from_file_with(
        &self,
        ticket: BuildTicket,
        path: &Path,
    ) -> Result<BuildReport> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MetashopError::Validation(format!("cannot read product file '{}': {e}", path.display()))
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let listings = parse_product_file(&content, &base_dir);

        let mut report = BuildReport::default();

        let names: Vec<String> = listings.iter().map(|l| l.name.clone()).collect();
        let catalog = Arc::clone(&self.catalog);
        let known = run_blocking(move || catalog.get_product_ids(&names)).await?;

        for (listing, existing) in listings.iter().zip(known) {
            if existing.is_some() {
                report.already_catalogued += 1;
                continue;
            }
            match self.add_product(listing).await {
                Ok(()) => report.added.push(listing.name.clone()),
                Err(MetashopError::ProductExists { .. }) => report.already_catalogued += 1,
                Err(e) => {
                    warn!(name = %listing.name, error = %e, "skipping product");
                    report.failed.push(FailedProduct {
                        name: listing.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if report.added.is_empty() {
            info!(
                already_catalogued = report.already_catalogued,
                failed = report.failed.len(),
                "catalog is current, no rebuild needed"
            );
            return Ok(report);
        }

        info!(added = report.added.len(), "products added, rebuilding index");
        self.rebuild_with(ticket, &mut report).await?;
        Ok(report)
    }

    /// Rebuild the index from the stored canonical images without ingesting.
    pub async fn reindex(&self) -> Result<BuildReport> {
        let ticket = self.coordinator.begin_build()?;
        self.reindex_with(ticket).await
    }

    #[instrument(skip_all)]
    pub async fn reindex_with(&self, ticket: BuildTicket) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        self.rebuild_with(ticket, &mut report).await?;
        Ok(report)
    }

    async fn add_product(&self, listing: &ProductListing) -> Result<()> {
        let enriched = self.enricher.enrich(listing).await?;

        let catalog = Arc::clone(&self.catalog);
        let images = Arc::clone(&self.images);
        let name = listing.name.clone();
        run_blocking(move || {
            let id = catalog.insert_product(&name, &enriched.walmart_sku, &enriched.amazon_asin)?;
            let stored = (|| {
                if enriched.walmart_price.is_some() || enriched.amazon_price.is_some() {
                    catalog.set_prices(
                        id,
                        enriched.walmart_price.unwrap_or(crate::types::UNKNOWN_PRICE),
                        enriched.amazon_price.unwrap_or(crate::types::UNKNOWN_PRICE),
                    )?;
                }
                images.save(id, &enriched.image)
            })();

            // A row without its image would count as catalogued on every later build.
            if let Err(e) = stored {
                if let Err(undo) = catalog.remove_product(id) {
                    warn!(product_id = id, error = %undo, "cannot remove partially catalogued product");
                }
                return Err(e);
            }
            info!(product_id = id, name = %name, "catalogued product");
            Ok(())
        })
        .await
    }

    async fn rebuild_with(&self, ticket: BuildTicket, report: &mut BuildReport) -> Result<()> {
        let entries = self.collect_training_entries().await?;
        report.training_entries = entries.len();
        let outcome = run_blocking(move || ticket.finish(&entries)).await?;
        report.record(&outcome);
        Ok(())
    }

    /// Extract descriptors from every stored canonical image. Images that
    /// cannot be read or decoded are skipped.
    pub async fn collect_training_entries(&self) -> Result<Vec<TrainingEntry>> {
        let images = Arc::clone(&self.images);
        let extractor = Arc::clone(&self.extractor);
        run_blocking(move || {
            let mut entries = Vec::new();
            for id in images.list_ids()? {
                let image = match images.load(id) {
                    Ok(Some(image)) => image,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(product_id = id, error = %e, "cannot read stored image, skipping");
                        continue;
                    }
                };
                match extractor.extract(&image) {
                    Ok(descriptors) => entries.push(TrainingEntry {
                        product_id: id,
                        descriptors,
                    }),
                    Err(e) => warn!(product_id = id, error = %e, "cannot extract stored image, skipping"),
                }
            }
            Ok(entries)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MetashopError::Internal(format!("blocking task failed: {e}")))?
}
