use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetashopError {
    // Wire errors
    #[error("frame too large: {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("server returned error: {0}")]
    Remote(String),

    // Serialization errors
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization error: {0}")]
    Bincode(String),

    // Snapshot errors
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("snapshot format error: {0}")]
    SnapshotFormat(String),

    // Index errors
    #[error("index error: {0}")]
    Index(String),

    #[error("index rebuild already in progress")]
    RebuildInProgress,

    // Image errors
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    // Collaborator errors
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("product already exists: {name}")]
    ProductExists { name: String },

    #[error("price lookup error: {0}")]
    PriceLookup(String),

    #[error("enrichment error: {0}")]
    Enrichment(String),

    // Validation errors
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // Internal
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Box<bincode::ErrorKind>> for MetashopError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        MetashopError::Bincode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MetashopError>;

impl MetashopError {
    pub fn status_code(&self) -> u16 {
        match self {
            MetashopError::NotFound(_) => 404,

            MetashopError::RebuildInProgress | MetashopError::ProductExists { .. } => 409,

            MetashopError::Validation(_)
            | MetashopError::MalformedRequest(_)
            | MetashopError::FrameTooLarge { .. } => 400,

            _ => 500,
        }
    }
}
