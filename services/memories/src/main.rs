use anyhow::{Context, Result};
use memories::config::{BlobBackend, Config};
use memories::{
    start_api_server, AppState, BackgroundWorker, BlobStore, ExtractionPipeline, JobQueue,
    Lifecycle, MemoryBlobStore, MetadataStore, NominatimGeocoder, OpenAiImageGenerator,
    S3BlobStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Memories Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    metadata_store
        .ensure_schema()
        .await
        .context("Failed to initialize database schema")?;

    let blob_store: Arc<dyn BlobStore> = match config.blob.backend {
        BlobBackend::S3 => Arc::new(S3BlobStore::new(&config.blob).await),
        BlobBackend::Memory => {
            warn!("Using in-memory blob store, uploads are lost on restart");
            MemoryBlobStore::new()
        }
    };

    let geocoder = Arc::new(
        NominatimGeocoder::new(&config.extraction).context("Failed to initialize geocoder")?,
    );
    let extraction = Arc::new(ExtractionPipeline::new(geocoder, &config.extraction));

    let mut lifecycle = Lifecycle::new(metadata_store.clone(), blob_store, extraction);

    // Background image generation
    let shutdown = CancellationToken::new();
    let worker_handle = if config.generator.enabled {
        let generator = Arc::new(
            OpenAiImageGenerator::new(&config.generator)
                .context("Failed to initialize image generator")?,
        );
        let (queue, receiver) = JobQueue::bounded(config.generator.queue_capacity);
        lifecycle = lifecycle.with_jobs(queue);

        let worker = BackgroundWorker::new(lifecycle.clone(), generator, &config.generator);
        Some(worker.spawn(receiver, shutdown.clone()))
    } else {
        info!("Background image generation disabled");
        None
    };

    // Create API state
    let api_state = AppState { lifecycle };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Memories service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down memories service");

    shutdown.cancel();
    api_handle.abort();
    if let Some(handle) = worker_handle {
        handle.abort();
    }

    info!("Memories service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
