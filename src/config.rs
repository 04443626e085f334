use crate::services::{blob_store::BlobStore, meta_store::MetaStore, trash::TrashEngine};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, sync::Arc};

/// Which blob-store implementation backs the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// SQLite index plus sharded payload files on local disk.
    Disk,
    /// Process-local map; contents vanish on exit.
    Memory,
}

impl Backend {
    fn parse_env(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disk" => Ok(Backend::Disk),
            "memory" => Ok(Backend::Memory),
            other => bail!("unknown IMAGE_VAULT_BACKEND `{}` (expected disk or memory)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub backend: Backend,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image vault object lifecycle service")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides IMAGE_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL for the object index (overrides IMAGE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Blob-store backend (overrides IMAGE_VAULT_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Create the object index schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let env_host = env::var("IMAGE_VAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("IMAGE_VAULT_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing IMAGE_VAULT_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading IMAGE_VAULT_PORT"),
        };
        let env_storage =
            env::var("IMAGE_VAULT_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("IMAGE_VAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/image_vault.db".into());
        let env_backend = match env::var("IMAGE_VAULT_BACKEND") {
            Ok(value) => Backend::parse_env(&value)?,
            Err(env::VarError::NotPresent) => Backend::Disk,
            Err(err) => return Err(err).context("reading IMAGE_VAULT_BACKEND"),
        };

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            backend: args.backend.unwrap_or(env_backend),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything the lifecycle operations need, shared across handlers.
///
/// The metadata store and trash engine are built over the same blob store so
/// they observe each other's writes.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<dyn BlobStore>,
    pub meta: MetaStore,
    pub trash: TrashEngine,
}

impl CoreContext {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            meta: MetaStore::new(store.clone()),
            trash: TrashEngine::new(store.clone()),
            store,
        }
    }
}
