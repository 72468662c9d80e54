use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetashopError, Result};
use crate::types::{IndexAlgorithm, DESCRIPTOR_BITS};

/// Config file consulted when no explicit path or `METASHOP_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "metashop.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub indexing: IndexingConfig,
    pub extraction: ExtractionConfig,
    pub storage: StorageConfig,
    pub prices: PriceConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Idle read timeout applied to every client connection.
    pub idle_timeout_secs: u64,
    pub max_frame_bytes: usize,
    /// How long shutdown waits for sessions to wind down.
    pub shutdown_grace_secs: u64,
    /// Read administrative commands from stdin.
    pub console: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 32304,
            idle_timeout_secs: 60,
            max_frame_bytes: 64 * 1024 * 1024,
            shutdown_grace_secs: 5,
            console: true,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// When a freshly built snapshot replaces the live one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Swap at the end of the rebuild.
    #[default]
    Immediate,
    /// Park the snapshot until the adoption loop picks it up.
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub algorithm: IndexAlgorithm,
    pub lsh_tables: usize,
    pub lsh_key_bits: usize,
    pub lsh_multi_probe_level: usize,
    pub lsh_seed: u64,
    /// Nearest neighbour accepted only if `d1 < ratio_threshold * d2`.
    pub ratio_threshold: f32,
    /// Ranked candidates returned per query image.
    pub top_k: usize,
    pub publish_mode: PublishMode,
    pub adopt_interval_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            algorithm: IndexAlgorithm::Lsh,
            lsh_tables: 12,
            lsh_key_bits: 9,
            lsh_multi_probe_level: 0,
            lsh_seed: 0x6d65_7461_7368_6f70,
            ratio_threshold: 0.75,
            top_k: 10,
            publish_mode: PublishMode::Immediate,
            adopt_interval_secs: 5,
        }
    }
}

impl IndexingConfig {
    pub fn adopt_interval(&self) -> Duration {
        Duration::from_secs(self.adopt_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_features: usize,
    pub fast_threshold: u8,
    /// Images are downscaled so their longest side fits this many pixels.
    pub max_dimension: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_features: 1024,
            fast_threshold: 20,
            max_dimension: 640,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub images_dir: PathBuf,
    pub index_dir: PathBuf,
    /// Image returned for unidentified products; a generated placeholder when unset.
    pub fallback_image: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::under(PathBuf::from("data"))
    }
}

impl StorageConfig {
    /// Storage layout rooted at `data_dir`.
    pub fn under(data_dir: PathBuf) -> Self {
        Self {
            catalog_path: data_dir.join("catalog.db"),
            images_dir: data_dir.join("images"),
            index_dir: data_dir.clone(),
            data_dir,
            fallback_image: None,
        }
    }

    pub fn create_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.images_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        if let Some(parent) = self.catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    /// Largest number of ids sent to the price collaborator in one call.
    pub max_batch: usize,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self { max_batch: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 32305,
            request_timeout_secs: 30,
        }
    }
}

impl AdminConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: TOML file (explicit path, `METASHOP_CONFIG`, or
    /// `./metashop.toml`), then `METASHOP_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let explicit = path
            .map(PathBuf::from)
            .or_else(|| std::env::var("METASHOP_CONFIG").ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MetashopError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MetashopError::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("METASHOP_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("METASHOP_PORT") {
            self.server.port = parse_env("METASHOP_PORT", &port)?;
        }
        if let Ok(port) = std::env::var("METASHOP_ADMIN_PORT") {
            self.admin.port = parse_env("METASHOP_ADMIN_PORT", &port)?;
        }
        if let Ok(dir) = std::env::var("METASHOP_DATA_DIR") {
            let fallback = self.storage.fallback_image.take();
            self.storage = StorageConfig::under(PathBuf::from(dir));
            self.storage.fallback_image = fallback;
        }
        if let Ok(level) = std::env::var("METASHOP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("METASHOP_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(algorithm) = std::env::var("METASHOP_INDEX_ALGORITHM") {
            self.indexing.algorithm = match algorithm.to_ascii_lowercase().as_str() {
                "lsh" => IndexAlgorithm::Lsh,
                "linear" => IndexAlgorithm::Linear,
                other => {
                    return Err(MetashopError::Config(format!(
                        "METASHOP_INDEX_ALGORITHM: unknown algorithm '{other}'"
                    )))
                }
            };
        }
        if let Ok(mode) = std::env::var("METASHOP_PUBLISH_MODE") {
            self.indexing.publish_mode = match mode.to_ascii_lowercase().as_str() {
                "immediate" => PublishMode::Immediate,
                "deferred" => PublishMode::Deferred,
                other => {
                    return Err(MetashopError::Config(format!(
                        "METASHOP_PUBLISH_MODE: unknown mode '{other}'"
                    )))
                }
            };
        }
        Ok(())
    }

    /// Validate all fields, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.idle_timeout_secs == 0 {
            errors.push("server.idle_timeout_secs must be positive".to_string());
        }
        if self.server.max_frame_bytes == 0 || self.server.max_frame_bytes > u32::MAX as usize {
            errors.push("server.max_frame_bytes must be in 1..=4294967295".to_string());
        }
        if self.indexing.lsh_tables == 0 {
            errors.push("indexing.lsh_tables must be positive".to_string());
        }
        if self.indexing.lsh_key_bits == 0 || self.indexing.lsh_key_bits > 32 {
            errors.push("indexing.lsh_key_bits must be in 1..=32".to_string());
        }
        if self.indexing.lsh_key_bits > DESCRIPTOR_BITS {
            errors.push(format!(
                "indexing.lsh_key_bits must not exceed {DESCRIPTOR_BITS}"
            ));
        }
        if self.indexing.lsh_multi_probe_level > 2 {
            errors.push("indexing.lsh_multi_probe_level must be 0, 1 or 2".to_string());
        }
        if !(self.indexing.ratio_threshold > 0.0 && self.indexing.ratio_threshold <= 1.0) {
            errors.push("indexing.ratio_threshold must be in (0, 1]".to_string());
        }
        if self.indexing.top_k == 0 {
            errors.push("indexing.top_k must be positive".to_string());
        }
        if self.extraction.max_features == 0 {
            errors.push("extraction.max_features must be positive".to_string());
        }
        if self.extraction.max_dimension < 64 {
            errors.push("extraction.max_dimension must be at least 64".to_string());
        }
        if self.prices.max_batch == 0 {
            errors.push("prices.max_batch must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            errors.push(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MetashopError::Config(errors.join("; ")))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MetashopError::Config(format!("{name}: invalid value '{value}'")))
}
