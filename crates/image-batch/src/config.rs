//! Configuration for the batch conversion service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Working-area storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scheduling and timeout configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Upload validation limits
    #[serde(default)]
    pub upload: UploadConfig,
    /// Converter limits and defaults
    #[serde(default)]
    pub conversion: ConversionConfig,
    /// Batch admission limits
    #[serde(default)]
    pub admission: AdmissionConfig,
}

impl BatchConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    ///
    /// When `path` is `None`, `IMAGE_BATCH_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("IMAGE_BATCH_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(size) = lookup("MAX_FILE_SIZE") {
            self.upload.max_file_size = parse_env("MAX_FILE_SIZE", &size)?;
        }
        if let Some(files) = lookup("MAX_FILES") {
            self.upload.max_files = parse_env("MAX_FILES", &files)?;
        }
        if let Some(concurrency) = lookup("MAX_CONCURRENCY") {
            self.processing.max_concurrency = Some(parse_env("MAX_CONCURRENCY", &concurrency)?);
        }
        if let Some(dir) = lookup("TEMP_DIR") {
            self.storage.root_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Request body limit for the batch upload route
    pub fn upload_body_limit(&self) -> usize {
        self.server.max_upload_size.unwrap_or_else(|| {
            // Room for per-part headers and the options fields
            let per_file = usize::try_from(self.upload.max_file_size)
                .unwrap_or(usize::MAX)
                .saturating_add(MULTIPART_PART_OVERHEAD);
            per_file
                .saturating_mul(self.upload.max_files)
                .saturating_add(MULTIPART_FIELDS_OVERHEAD)
        })
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processing.max_concurrency == Some(0) {
            return Err(Error::Config("processing.max_concurrency must be at least 1".into()));
        }
        if self.upload.max_files == 0 {
            return Err(Error::Config("upload.max_files must be at least 1".into()));
        }
        if !(1..=100).contains(&self.conversion.default_quality) {
            return Err(Error::Config("conversion.default_quality must be 1-100".into()));
        }
        if self.admission.max_active_jobs == Some(0) {
            return Err(Error::Config("admission.max_active_jobs must be at least 1".into()));
        }
        Ok(())
    }
}

const MULTIPART_PART_OVERHEAD: usize = 16 * 1024;
const MULTIPART_FIELDS_OVERHEAD: usize = 1024 * 1024;

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {:?}", key, value)))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body for batch uploads (bytes). `None` sizes it to
    /// fit `upload.max_files` files of `upload.max_file_size` each.
    pub max_upload_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_upload_size: None, // Derived from upload limits
        }
    }
}

/// Working-area storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for per-job working areas
    pub root_dir: PathBuf,
    /// How long a finished job and its archive are kept (default: 1 hour)
    pub retention_secs: u64,
    /// How often the retention sweep runs (default: 60s)
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./temp"),
            retention_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Scheduling and timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Global number of concurrent conversions (default: CPU count, max 8)
    pub max_concurrency: Option<usize>,
    /// Timeout for converting a single file (default: 120s)
    pub task_timeout_secs: u64,
    /// Jobs still running after this age are failed (default: 30 minutes)
    pub job_max_age_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None, // Auto-detect from CPU count
            task_timeout_secs: 120,
            job_max_age_secs: 1800,
        }
    }
}

impl ProcessingConfig {
    pub fn concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn job_max_age(&self) -> Duration {
        Duration::from_secs(self.job_max_age_secs)
    }
}

/// Upload validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum number of files per batch (default: 100)
    pub max_files: usize,
    /// Maximum size of a single file in bytes (default: 10MB)
    pub max_file_size: u64,
    /// Accepted upload extensions, lowercase
    pub allowed_extensions: Vec<String>,
}

fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_file_size: 10 * 1024 * 1024, // 10MB
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl UploadConfig {
    /// Check a client file name against the allowed extensions
    pub fn is_allowed(&self, file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.allowed_extensions.iter().any(|a| *a == ext)
            })
            .unwrap_or(false)
    }
}

/// Converter limits and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Decoded width * height ceiling (default: 100 megapixels)
    pub max_pixels: u64,
    /// JPEG quality when the request does not specify one
    pub default_quality: u8,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_pixels: 100_000_000,
            default_quality: 80,
        }
    }
}

/// Batch admission limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum jobs not yet terminal; `None` means unlimited
    pub max_active_jobs: Option<usize>,
}
