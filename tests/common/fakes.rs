use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use metashop::catalog::{Catalog, ImageStore, PriceLookup};
use metashop::error::{MetashopError, Result};
use metashop::features::FeatureExtractor;
use metashop::index::EngineHandle;
use metashop::server::{SessionContext, SessionSettings};
use metashop::types::{
    Descriptor, ImageData, ProductId, ProductRecord, Retailer, DESCRIPTOR_BYTES, UNKNOWN_PRICE,
};

/// Treats image bytes as concatenated 32-byte descriptors.
pub struct RawDescriptorExtractor;

impl FeatureExtractor for RawDescriptorExtractor {
    fn extract(&self, image: &ImageData) -> Result<Vec<Descriptor>> {
        if image.data.len() % DESCRIPTOR_BYTES != 0 {
            return Err(MetashopError::Image(::image::ImageError::Decoding(
                ::image::error::DecodingError::new(
                    ::image::error::ImageFormatHint::Unknown,
                    format!("{} bytes is not a whole number of descriptors", image.data.len()),
                ),
            )));
        }
        Ok(image
            .data
            .chunks_exact(DESCRIPTOR_BYTES)
            .filter_map(Descriptor::from_slice)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    products: Mutex<Vec<ProductRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a product with explicit prices, returning its id.
    pub fn add(&self, name: &str, sku: &str, asin: &str, walmart: f64, amazon: f64) -> ProductId {
        let id = self.insert_product(name, sku, asin).unwrap();
        self.set_prices(id, walmart, amazon).unwrap();
        id
    }
}

impl Catalog for MemoryCatalog {
    fn get_product(&self, id: ProductId) -> Result<Option<ProductRecord>> {
        Ok(self.products.lock().iter().find(|p| p.id == id).cloned())
    }

    fn get_product_ids(&self, names: &[String]) -> Result<Vec<Option<ProductId>>> {
        let products = self.products.lock();
        Ok(names
            .iter()
            .map(|n| products.iter().find(|p| &p.name == n).map(|p| p.id))
            .collect())
    }

    fn insert_product(&self, name: &str, walmart_sku: &str, amazon_asin: &str) -> Result<ProductId> {
        let mut products = self.products.lock();
        if products.iter().any(|p| p.name == name) {
            return Err(MetashopError::ProductExists {
                name: name.to_string(),
            });
        }
        let id = products.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        products.push(ProductRecord {
            id,
            name: name.to_string(),
            walmart_sku: walmart_sku.to_string(),
            amazon_asin: amazon_asin.to_string(),
            walmart_price: UNKNOWN_PRICE,
            amazon_price: UNKNOWN_PRICE,
        });
        Ok(id)
    }

    fn set_prices(&self, id: ProductId, walmart: f64, amazon: f64) -> Result<()> {
        let mut products = self.products.lock();
        let product = products
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| MetashopError::NotFound(format!("product {id}")))?;
        product.walmart_price = walmart;
        product.amazon_price = amazon;
        Ok(())
    }

    fn cached_price(&self, retailer: Retailer, external_id: &str) -> Result<Option<f64>> {
        let products = self.products.lock();
        Ok(products
            .iter()
            .find(|p| p.external_id(retailer) == external_id)
            .map(|p| match retailer {
                Retailer::Walmart => p.walmart_price,
                Retailer::Amazon => p.amazon_price,
            })
            .filter(|price| *price >= 0.0))
    }

    fn remove_product(&self, id: ProductId) -> Result<()> {
        self.products.lock().retain(|p| p.id != id);
        Ok(())
    }

    fn product_count(&self) -> Result<usize> {
        Ok(self.products.lock().len())
    }
}

#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<BTreeMap<ProductId, ImageData>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageStore for MemoryImageStore {
    fn load(&self, id: ProductId) -> Result<Option<ImageData>> {
        Ok(self.images.lock().get(&id).cloned())
    }

    fn save(&self, id: ProductId, image: &ImageData) -> Result<()> {
        self.images.lock().insert(id, image.clone());
        Ok(())
    }

    fn list_ids(&self) -> Result<Vec<ProductId>> {
        Ok(self.images.lock().keys().copied().collect())
    }
}

/// Price source keyed by external id. Records every batch it is sent and can
/// be told to fail for one retailer.
pub struct FakePrices {
    prices: HashMap<(Retailer, String), f64>,
    max_batch: usize,
    failing: Option<Retailer>,
    pub batches: Mutex<Vec<(Retailer, usize)>>,
}

impl FakePrices {
    pub fn new(max_batch: usize) -> Self {
        Self {
            prices: HashMap::new(),
            max_batch,
            failing: None,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_price(mut self, retailer: Retailer, external_id: &str, price: f64) -> Self {
        self.prices.insert((retailer, external_id.to_string()), price);
        self
    }

    pub fn failing_for(mut self, retailer: Retailer) -> Self {
        self.failing = Some(retailer);
        self
    }
}

#[async_trait]
impl PriceLookup for FakePrices {
    fn max_batch(&self) -> usize {
        self.max_batch
    }

    async fn lookup_prices(
        &self,
        retailer: Retailer,
        external_ids: &[String],
    ) -> Result<Vec<Option<f64>>> {
        assert!(external_ids.len() <= self.max_batch, "batch over limit");
        self.batches.lock().push((retailer, external_ids.len()));
        if self.failing == Some(retailer) {
            return Err(MetashopError::PriceLookup("retailer unavailable".to_string()));
        }
        Ok(external_ids
            .iter()
            .map(|id| self.prices.get(&(retailer, id.clone())).copied())
            .collect())
    }
}

pub fn fallback() -> ImageData {
    ImageData::new(b"fallback".to_vec(), "png")
}

/// Wiring for session-level tests.
pub struct Fixture {
    pub engine: Arc<EngineHandle>,
    pub catalog: Arc<MemoryCatalog>,
    pub images: Arc<MemoryImageStore>,
    pub prices: Arc<FakePrices>,
}

impl Fixture {
    pub fn new(engine: Arc<EngineHandle>) -> Self {
        Self::with_prices(engine, FakePrices::new(20))
    }

    pub fn with_prices(engine: Arc<EngineHandle>, prices: FakePrices) -> Self {
        Self {
            engine,
            catalog: Arc::new(MemoryCatalog::new()),
            images: Arc::new(MemoryImageStore::new()),
            prices: Arc::new(prices),
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context_with(SessionSettings::default())
    }

    pub fn context_with(&self, settings: SessionSettings) -> SessionContext {
        SessionContext {
            engine: self.engine.clone(),
            extractor: Arc::new(RawDescriptorExtractor),
            catalog: self.catalog.clone(),
            images: self.images.clone(),
            prices: self.prices.clone(),
            fallback_image: Arc::new(fallback()),
            settings,
        }
    }
}

pub fn short_settings(idle: Duration) -> SessionSettings {
    SessionSettings {
        idle_timeout: idle,
        max_frame_bytes: 1024 * 1024,
    }
}
