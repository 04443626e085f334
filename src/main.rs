use anyhow::{Context, Result};
use axum::Router;
use image_vault::{
    config::{AppConfig, Backend, CoreContext},
    routes,
    services::{
        blob_store::{BlobStore, MemoryBlobStore},
        disk_store::DiskBlobStore,
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-vault with config: {:?}", cfg);

    let store: Arc<dyn BlobStore> = match cfg.backend {
        Backend::Memory => {
            if migrate {
                tracing::info!("Memory backend has no schema; nothing to migrate.");
                return Ok(());
            }
            tracing::warn!("Using the in-memory backend; objects will not survive a restart");
            Arc::new(MemoryBlobStore::new())
        }
        Backend::Disk => {
            let disk = open_disk_store(&cfg).await?;
            disk.init_schema().await.context("applying object index schema")?;
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(());
            }
            Arc::new(disk)
        }
    };

    // --- Build router ---
    let app: Router = routes::routes().with_state(CoreContext::new(store));

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Prepare the payload directory and SQLite file, then connect.
async fn open_disk_store(cfg: &AppConfig) -> Result<DiskBlobStore> {
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLite will not create the file itself without `mode=rwc`.
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(db_path_obj)
    {
        tracing::warn!("Failed to open database file {}: {}", db_path, e);
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(DiskBlobStore::new(Arc::new(db), cfg.storage_dir.clone()))
}
