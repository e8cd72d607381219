use anyhow::{Context, Result};
use axum::Router;
use file_store::{
    config::{AppConfig, RemoteBackend, RunMode},
    db, routes,
    services::{
        file_service::FileService,
        metadata::MetadataStore,
        offload::{OffloadQueue, OffloadWorker},
        remote::{MemoryObjectClient, MultipartClient, MultipartProvider, RemoteObjectProvider, S3Client},
        retention::RetentionSweeper,
        staging::LocalStagingStore,
    },
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    let staging = LocalStagingStore::new(&cfg.storage_dir, cfg.chunk_size, cfg.buffered_threshold);
    staging
        .ensure_root()
        .await
        .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    db::run_migrations(&db).await.context("applying migrations")?;

    match mode {
        RunMode::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::Sweep => {
            let sweeper = RetentionSweeper::new(
                &cfg.storage_dir,
                MetadataStore::new(db.clone()),
                cfg.retention_max_age(),
            );
            let report = sweeper.sweep().await.context("retention sweep")?;
            tracing::info!(?report, "Retention sweep complete.");
            return Ok(());
        }
        RunMode::Serve => {}
    }

    // --- Remote tier ---
    let client: Arc<dyn MultipartClient> = match cfg.remote_backend {
        RemoteBackend::S3 => Arc::new(S3Client::new(cfg.s3_settings()?).await),
        RemoteBackend::Memory => {
            tracing::warn!("Using in-memory remote backend; offloaded files are lost on restart");
            Arc::new(MemoryObjectClient::new())
        }
    };
    let provider: Arc<dyn RemoteObjectProvider> =
        Arc::new(MultipartProvider::new(client, cfg.part_size, cfg.chunk_size));

    // --- Initialize core services ---
    let metadata = MetadataStore::new(db.clone());
    let queue = OffloadQueue::new(db);
    let offload = OffloadWorker::new(
        queue.clone(),
        metadata.clone(),
        provider.clone(),
        cfg.offload(),
    )
    .spawn();
    let service = FileService::new(staging, metadata, queue, provider);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    offload.shutdown().await;
    tracing::info!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received.");
}
