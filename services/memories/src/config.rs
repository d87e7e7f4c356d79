use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the memories service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Blob storage configuration
    #[serde(default)]
    pub blob: BlobConfig,
    /// Metadata extraction configuration
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Background image generation configuration
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Which blob store implementation backs the service
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlobBackend {
    /// S3 or any S3-compatible object store
    S3,
    /// Process-local store, contents are lost on restart
    Memory,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    #[serde(default = "default_blob_backend")]
    pub backend: BlobBackend,
    /// S3 bucket name for photos and generated images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL objects are served from. When unset, urls are `s3://bucket/key`.
    pub public_base_url: Option<String>,
}

/// Metadata extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Reverse geocoding endpoint (Nominatim compatible)
    #[serde(default = "default_geocoder_url")]
    pub geocoder_url: String,
    /// User agent sent to the geocoder
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// ISO country code considered domestic; omitted from place names
    #[serde(default = "default_home_country")]
    pub home_country_code: String,
    /// Timeout for one reverse geocoding call in seconds
    #[serde(default = "default_geocode_timeout_secs")]
    pub geocode_timeout_secs: u64,
    /// Timeout for parsing the EXIF block of one file in seconds
    #[serde(default = "default_exif_timeout_secs")]
    pub exif_timeout_secs: u64,
}

/// Background image generation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Image generation endpoint
    #[serde(default = "default_generator_url")]
    pub endpoint_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_generator_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Number of sketch images generated per event
    #[serde(default = "default_sketch_count")]
    pub sketch_count: u32,
    /// Number of background images generated per event
    #[serde(default = "default_background_count")]
    pub background_count: u32,
    /// Timeout for one generation request in seconds
    #[serde(default = "default_generator_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pending jobs beyond this are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Jobs running at the same time
    #[serde(default = "default_generator_concurrency")]
    pub concurrency: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size for uploads in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "memories-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_database_url() -> String {
    "sqlite://memories.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_blob_backend() -> BlobBackend {
    BlobBackend::S3
}

fn default_bucket() -> String {
    "memories".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_geocoder_url() -> String {
    "https://nominatim.openstreetmap.org/reverse".to_string()
}

fn default_user_agent() -> String {
    "memories-service/0.1".to_string()
}

fn default_home_country() -> String {
    "us".to_string()
}

fn default_geocode_timeout_secs() -> u64 {
    5
}

fn default_exif_timeout_secs() -> u64 {
    3
}

fn default_generator_url() -> String {
    "https://api.openai.com/v1/images/generations".to_string()
}

fn default_generator_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_sketch_count() -> u32 {
    1
}

fn default_background_count() -> u32 {
    1
}

fn default_generator_timeout_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    64
}

fn default_generator_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024 // 25MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "memories-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/memories").required(false))
            .add_source(config::File::with_name("/etc/memories/memories").required(false))
            // Override with environment variables
            // MEMORIES__BLOB__BUCKET -> blob.bucket
            .add_source(
                config::Environment::with_prefix("MEMORIES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }
}

impl ExtractionConfig {
    pub fn geocode_timeout(&self) -> Duration {
        Duration::from_secs(self.geocode_timeout_secs)
    }

    pub fn exif_timeout(&self) -> Duration {
        Duration::from_secs(self.exif_timeout_secs)
    }
}

impl GeneratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            geocoder_url: default_geocoder_url(),
            user_agent: default_user_agent(),
            home_country_code: default_home_country(),
            geocode_timeout_secs: default_geocode_timeout_secs(),
            exif_timeout_secs: default_exif_timeout_secs(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: default_generator_url(),
            api_key: None,
            model: default_generator_model(),
            image_size: default_image_size(),
            sketch_count: default_sketch_count(),
            background_count: default_background_count(),
            request_timeout_secs: default_generator_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            concurrency: default_generator_concurrency(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
