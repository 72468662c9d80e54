use serde::{Deserialize, Serialize};

/// Catalog identifier of a product (the wire calls it `metashop_id`).
pub type ProductId = i64;

/// Length in bytes of one binary descriptor (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Number of bits in one descriptor.
pub const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * 8;

/// Price reported when a retailer price is unknown or could not be fetched.
pub const UNKNOWN_PRICE: f64 = -1.0;

/// A fixed-length binary feature vector describing one keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DESCRIPTOR_BYTES] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Value of bit `index` (0 = least significant bit of the first byte).
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (index % 8)) & 1 == 1
    }
}

/// Descriptors extracted from one catalogued product image, awaiting a rebuild.
#[derive(Debug, Clone)]
pub struct TrainingEntry {
    pub product_id: ProductId,
    pub descriptors: Vec<Descriptor>,
}

/// One ranked result of a matching query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub product_id: ProductId,
    pub vote_count: usize,
}

/// Result of querying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The query image produced no descriptors, so nothing could be analysed.
    NoDescriptors,
    /// Candidates ranked by vote count; empty when nothing passed the ratio test.
    Ranked(Vec<MatchCandidate>),
}

impl QueryOutcome {
    pub fn best(&self) -> Option<&MatchCandidate> {
        match self {
            QueryOutcome::NoDescriptors => None,
            QueryOutcome::Ranked(candidates) => candidates.first(),
        }
    }
}

/// Raw image bytes plus a file-type hint. Serialized with base64 `data` on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
    pub extension: String,
}

impl ImageData {
    pub fn new(data: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            data,
            extension: extension.into(),
        }
    }
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("bytes", &self.data.len())
            .field("extension", &self.extension)
            .finish()
    }
}

/// A catalogued product as stored by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub name: String,
    pub walmart_sku: String,
    pub amazon_asin: String,
    pub walmart_price: f64,
    pub amazon_price: f64,
}

impl ProductRecord {
    pub fn external_id(&self, retailer: Retailer) -> &str {
        match retailer {
            Retailer::Walmart => &self.walmart_sku,
            Retailer::Amazon => &self.amazon_asin,
        }
    }
}

/// Retailers whose prices are reported in a price check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retailer {
    Walmart,
    Amazon,
}

impl Retailer {
    pub const ALL: [Retailer; 2] = [Retailer::Walmart, Retailer::Amazon];
}

impl std::fmt::Display for Retailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Retailer::Walmart => write!(f, "walmart"),
            Retailer::Amazon => write!(f, "amazon"),
        }
    }
}

/// Search structure used by a matching snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAlgorithm {
    /// Exhaustive Hamming scan.
    Linear,
    /// Bit-sampling locality-sensitive hashing.
    #[default]
    Lsh,
}

impl std::fmt::Display for IndexAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexAlgorithm::Linear => write!(f, "linear"),
            IndexAlgorithm::Lsh => write!(f, "lsh"),
        }
    }
}

mod base64_data {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 image data: {e}")))
    }
}
