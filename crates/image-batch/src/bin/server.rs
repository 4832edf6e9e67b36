//! Batch server binary
//!
//! Run with: cargo run -p image-batch --bin image-batch-server

use image_batch::{
    config::BatchConfig,
    server::{routes::ENDPOINTS, BatchServer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "image_batch=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = BatchConfig::load(None)?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Storage root: {}", config.storage.root_dir.display());
    tracing::info!("  - Conversion slots: {}", config.processing.concurrency());
    tracing::info!(
        "  - Upload limits: {} files, {} bytes per file",
        config.upload.max_files,
        config.upload.max_file_size
    );
    tracing::info!("  - Retention: {}s", config.storage.retention_secs);

    // Create and start server
    let server = BatchServer::new(config).await?;

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nEndpoints:");
    for (route, description) in ENDPOINTS {
        println!("  {:<44} - {}", route, description);
    }
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
