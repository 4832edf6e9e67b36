//! Application state for the batch server

use std::sync::Arc;

use crate::config::BatchConfig;
use crate::conversion::Converter;
use crate::error::Result;
use crate::pipeline::Pipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: BatchConfig,
    /// Job pipeline
    pipeline: Pipeline,
    /// Server start time
    started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Create state with the image converter and prepare the storage root
    pub async fn new(config: BatchConfig) -> Result<Self> {
        let pipeline = Pipeline::with_image_converter(config.clone());
        Self::with_pipeline(config, pipeline).await
    }

    /// Create state around a custom converter
    pub async fn with_converter(config: BatchConfig, converter: Arc<dyn Converter>) -> Result<Self> {
        let pipeline = Pipeline::new(config.clone(), converter);
        Self::with_pipeline(config, pipeline).await
    }

    async fn with_pipeline(config: BatchConfig, pipeline: Pipeline) -> Result<Self> {
        tracing::info!("Initializing batch state (storage root {})...", config.storage.root_dir.display());

        let storage = pipeline.storage();
        storage.ensure_root().await?;
        let purged = storage.purge_all().await?;
        if purged > 0 {
            tracing::info!("Removed {} working areas left by a previous run", purged);
        }

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                pipeline,
                started_at: chrono::Utc::now(),
            }),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Get the job pipeline
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Seconds since the state was created
    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.inner.started_at).num_seconds()
    }
}
