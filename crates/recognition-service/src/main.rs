use anyhow::{Context, Result};
use recognition_service::detector::OnnxFaceDetector;
use recognition_service::gallery::{GalleryStore, MemoryGalleryStore, SqliteGalleryStore};
use recognition_service::pipeline::FfmpegVideoSource;
use recognition_service::{api, AppState, ServiceConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = telemetry::init_with_service("recognition-service");

    info!("Starting recognition service...");

    let config = ServiceConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        node_id = %config.node_id,
        threshold = config.defaults.threshold,
        detector_instances = config.detector_instances,
        "recognition service configuration"
    );

    let gallery: Arc<dyn GalleryStore> = match &config.gallery_database_url {
        Some(url) => {
            info!("Opening gallery database");
            Arc::new(
                SqliteGalleryStore::connect(url)
                    .await
                    .context("Failed to open gallery database")?,
            )
        }
        None => {
            info!("Running with an in-memory gallery");
            Arc::new(MemoryGalleryStore::new())
        }
    };

    let detector = OnnxFaceDetector::load(config.detector.clone())
        .context("Failed to load face recognition models")?;
    info!(
        provider = %detector.execution_provider(),
        "face recognition models loaded"
    );

    let state = AppState::new(
        &config,
        gallery,
        Arc::new(detector),
        Arc::new(FfmpegVideoSource),
    );

    let app = api::router(state.clone());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Recognition service listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
    if let Err(e) = state.shutdown().await {
        error!("Error during shutdown: {}", e);
    }
}
