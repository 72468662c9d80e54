use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::{Catalog, PriceLookup};
use crate::error::{MetashopError, Result};
use crate::types::Retailer;

/// Serves the prices cached in the catalog by the last enrichment run.
pub struct CatalogPriceLookup {
    catalog: Arc<dyn Catalog>,
    max_batch: usize,
}

impl CatalogPriceLookup {
    pub fn new(catalog: Arc<dyn Catalog>, max_batch: usize) -> Self {
        Self {
            catalog,
            max_batch: max_batch.max(1),
        }
    }
}

#[async_trait]
impl PriceLookup for CatalogPriceLookup {
    fn max_batch(&self) -> usize {
        self.max_batch
    }

    async fn lookup_prices(
        &self,
        retailer: Retailer,
        external_ids: &[String],
    ) -> Result<Vec<Option<f64>>> {
        if external_ids.len() > self.max_batch {
            return Err(MetashopError::PriceLookup(format!(
                "batch of {} exceeds limit of {}",
                external_ids.len(),
                self.max_batch
            )));
        }
        let catalog = Arc::clone(&self.catalog);
        let ids = external_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            ids.iter()
                .map(|id| {
                    if id.is_empty() {
                        Ok(None)
                    } else {
                        catalog.cached_price(retailer, id)
                    }
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| MetashopError::Internal(format!("price lookup task failed: {e}")))?
    }
}
