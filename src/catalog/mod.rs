//! Collaborators consulted by sessions and the offline build: the product
//! catalog, the canonical image store and the price lookup.

pub mod images;
pub mod prices;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ImageData, ProductId, ProductRecord, Retailer};

pub use images::{fallback_image, DirImageStore};
pub use prices::CatalogPriceLookup;
pub use sqlite::SqliteCatalog;

/// Persistent product catalog. Implementations serialise access internally.
pub trait Catalog: Send + Sync {
    fn get_product(&self, id: ProductId) -> Result<Option<ProductRecord>>;

    /// Batch lookup, one slot per requested id in request order.
    fn get_products(&self, ids: &[ProductId]) -> Result<Vec<Option<ProductRecord>>> {
        ids.iter().map(|id| self.get_product(*id)).collect()
    }

    /// Resolve product names to ids, one slot per name in request order.
    fn get_product_ids(&self, names: &[String]) -> Result<Vec<Option<ProductId>>>;

    /// Insert a product with unknown prices. Fails with `ProductExists` when
    /// the name is already catalogued.
    fn insert_product(&self, name: &str, walmart_sku: &str, amazon_asin: &str)
        -> Result<ProductId>;

    fn set_prices(&self, id: ProductId, walmart: f64, amazon: f64) -> Result<()>;

    /// Delete a product. Removing an unknown id is not an error.
    fn remove_product(&self, id: ProductId) -> Result<()>;

    /// Last stored price for a retailer's external identifier.
    fn cached_price(&self, retailer: Retailer, external_id: &str) -> Result<Option<f64>>;

    fn product_count(&self) -> Result<usize>;
}

/// Canonical product images keyed by product id.
pub trait ImageStore: Send + Sync {
    fn load(&self, id: ProductId) -> Result<Option<ImageData>>;
    fn save(&self, id: ProductId, image: &ImageData) -> Result<()>;
    /// Every product id with a stored image, ascending.
    fn list_ids(&self) -> Result<Vec<ProductId>>;
}

/// Retailer price source. Callers never send more than `max_batch` ids per call.
#[async_trait]
pub trait PriceLookup: Send + Sync {
    fn max_batch(&self) -> usize;

    /// Prices for `external_ids`, one slot per id in request order.
    async fn lookup_prices(
        &self,
        retailer: Retailer,
        external_ids: &[String],
    ) -> Result<Vec<Option<f64>>>;
}
