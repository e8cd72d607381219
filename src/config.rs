use crate::services::{
    chunked::{DEFAULT_CHUNK_SIZE, DEFAULT_PART_SIZE},
    offload::OffloadConfig,
    remote::S3Settings,
    staging::DEFAULT_BUFFERED_THRESHOLD,
};
use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// S3 rejects non-final multipart parts below this size.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RemoteBackend {
    /// Any S3-compatible endpoint.
    S3,
    /// In-process store; contents are lost on restart.
    Memory,
}

/// What the binary does after loading configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Sweep,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub chunk_size: usize,
    pub part_size: usize,
    pub buffered_threshold: u64,
    pub max_upload_bytes: usize,
    pub remote_backend: RemoteBackend,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub offload_workers: usize,
    pub offload_poll_interval_ms: u64,
    pub offload_max_attempts: i64,
    pub offload_retry_base_secs: u64,
    pub retention_max_age_days: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Tiered file storage service")]
pub struct Args {
    /// Host to bind to (overrides FILE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding local copies (overrides FILE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Read/write chunk size in bytes (overrides FILE_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Multipart part size in bytes (overrides FILE_STORE_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<usize>,

    /// Uploads declared at or below this size are buffered in memory
    /// (overrides FILE_STORE_BUFFERED_THRESHOLD)
    #[arg(long)]
    pub buffered_threshold: Option<u64>,

    /// Maximum upload request body (overrides FILE_STORE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Remote tier backend (overrides FILE_STORE_REMOTE_BACKEND)
    #[arg(long, value_enum)]
    pub remote_backend: Option<RemoteBackend>,

    /// S3-compatible endpoint URL (overrides FILE_STORE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 region (overrides FILE_STORE_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// S3 bucket (overrides FILE_STORE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Concurrent offload uploads (overrides FILE_STORE_OFFLOAD_WORKERS)
    #[arg(long)]
    pub offload_workers: Option<usize>,

    /// Upload attempts before a job is marked failed
    /// (overrides FILE_STORE_OFFLOAD_MAX_ATTEMPTS)
    #[arg(long)]
    pub offload_max_attempts: Option<i64>,

    /// Local copies older than this are eligible for eviction
    /// (overrides FILE_STORE_RETENTION_MAX_AGE_DAYS)
    #[arg(long)]
    pub retention_max_age_days: Option<u64>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "sweep")]
    pub migrate: bool,

    /// Run one retention sweep over the storage directory and exit
    #[arg(long)]
    pub sweep: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.sweep {
            RunMode::Sweep
        } else {
            RunMode::Serve
        };
        let cfg = Self::from_args(args)?;
        cfg.validate()?;
        cfg.validate_mode(mode)?;
        Ok((cfg, mode))
    }

    /// Merge parsed CLI arguments over `FILE_STORE_*` environment variables.
    pub fn from_args(args: Args) -> Result<Self> {
        let remote_backend = match args.remote_backend {
            Some(backend) => backend,
            None => match env::var("FILE_STORE_REMOTE_BACKEND") {
                Ok(value) => <RemoteBackend as ValueEnum>::from_str(&value, true)
                    .map_err(|e| anyhow!(e))
                    .with_context(|| {
                        format!("parsing FILE_STORE_REMOTE_BACKEND value `{value}`")
                    })?,
                Err(env::VarError::NotPresent) => RemoteBackend::Memory,
                Err(err) => return Err(err).context("reading FILE_STORE_REMOTE_BACKEND"),
            },
        };

        Ok(Self {
            host: pick(args.host, "FILE_STORE_HOST", "0.0.0.0".to_string())?,
            port: pick(args.port, "FILE_STORE_PORT", 3000)?,
            storage_dir: pick(
                args.storage_dir,
                "FILE_STORE_STORAGE_DIR",
                "./data/files".to_string(),
            )?,
            database_url: pick(
                args.database_url,
                "FILE_STORE_DATABASE_URL",
                "sqlite://./data/meta/file_store.db".to_string(),
            )?,
            chunk_size: pick(args.chunk_size, "FILE_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            part_size: pick(args.part_size, "FILE_STORE_PART_SIZE", DEFAULT_PART_SIZE)?,
            buffered_threshold: pick(
                args.buffered_threshold,
                "FILE_STORE_BUFFERED_THRESHOLD",
                DEFAULT_BUFFERED_THRESHOLD,
            )?,
            max_upload_bytes: pick(
                args.max_upload_bytes,
                "FILE_STORE_MAX_UPLOAD_BYTES",
                1024 * 1024 * 1024,
            )?,
            remote_backend,
            s3_endpoint: args.s3_endpoint.or(env_opt("FILE_STORE_S3_ENDPOINT")),
            s3_region: pick(args.s3_region, "FILE_STORE_S3_REGION", "us-east-1".to_string())?,
            s3_bucket: args.s3_bucket.or(env_opt("FILE_STORE_S3_BUCKET")),
            s3_access_key_id: env_opt("FILE_STORE_S3_ACCESS_KEY_ID"),
            s3_secret_access_key: env_opt("FILE_STORE_S3_SECRET_ACCESS_KEY"),
            offload_workers: pick(args.offload_workers, "FILE_STORE_OFFLOAD_WORKERS", 2)?,
            offload_poll_interval_ms: env_or("FILE_STORE_OFFLOAD_POLL_INTERVAL_MS", 1000)?,
            offload_max_attempts: pick(
                args.offload_max_attempts,
                "FILE_STORE_OFFLOAD_MAX_ATTEMPTS",
                5,
            )?,
            offload_retry_base_secs: env_or("FILE_STORE_OFFLOAD_RETRY_BASE_SECS", 2)?,
            retention_max_age_days: pick(
                args.retention_max_age_days,
                "FILE_STORE_RETENTION_MAX_AGE_DAYS",
                30,
            )?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk_size must be positive");
        ensure!(self.part_size > 0, "part_size must be positive");
        ensure!(self.offload_workers > 0, "offload_workers must be positive");
        ensure!(self.offload_max_attempts > 0, "offload_max_attempts must be positive");
        if self.remote_backend == RemoteBackend::S3 {
            ensure!(
                self.part_size >= S3_MIN_PART_SIZE,
                "part_size must be at least {S3_MIN_PART_SIZE} bytes for the s3 backend"
            );
            ensure!(
                self.s3_bucket.is_some(),
                "FILE_STORE_S3_BUCKET is required for the s3 backend"
            );
        }
        Ok(())
    }

    /// Eviction relies on the remote copy outliving the process, which the
    /// in-memory backend cannot provide.
    pub fn validate_mode(&self, mode: RunMode) -> Result<()> {
        ensure!(
            !(mode == RunMode::Sweep && self.remote_backend == RemoteBackend::Memory),
            "--sweep requires a persistent remote backend; the memory backend loses \
             offloaded files on restart, so evicting local copies would destroy them"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn offload(&self) -> OffloadConfig {
        OffloadConfig {
            max_workers: self.offload_workers,
            poll_interval: Duration::from_millis(self.offload_poll_interval_ms),
            max_attempts: self.offload_max_attempts,
            retry_base: Duration::from_secs(self.offload_retry_base_secs),
        }
    }

    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_max_age_days * 24 * 60 * 60)
    }

    pub fn s3_settings(&self) -> Result<S3Settings> {
        let bucket = self
            .s3_bucket
            .clone()
            .context("FILE_STORE_S3_BUCKET is required for the s3 backend")?;
        Ok(S3Settings {
            endpoint_url: self.s3_endpoint.clone(),
            region: self.s3_region.clone(),
            bucket,
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
        })
    }
}

// Secrets stay out of the startup log.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("chunk_size", &self.chunk_size)
            .field("part_size", &self.part_size)
            .field("buffered_threshold", &self.buffered_threshold)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("remote_backend", &self.remote_backend)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_region", &self.s3_region)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_credentials", &self.s3_access_key_id.is_some())
            .field("offload_workers", &self.offload_workers)
            .field("offload_max_attempts", &self.offload_max_attempts)
            .field("retention_max_age_days", &self.retention_max_age_days)
            .finish_non_exhaustive()
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

fn pick<T>(cli: Option<T>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match cli {
        Some(value) => Ok(value),
        None => env_or(key, default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> AppConfig {
        let mut full = vec!["file-store"];
        full.extend_from_slice(argv);
        AppConfig::from_args(Args::parse_from(full)).unwrap()
    }

    #[test]
    fn cli_arguments_take_precedence() {
        let cfg = parse(&[
            "--port",
            "8081",
            "--chunk-size",
            "4096",
            "--remote-backend",
            "s3",
            "--s3-bucket",
            "files",
        ]);
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.remote_backend, RemoteBackend::S3);
        assert_eq!(cfg.s3_bucket.as_deref(), Some("files"));
        assert_eq!(cfg.addr(), format!("{}:8081", cfg.host));
    }

    #[test]
    fn s3_backend_requires_bucket_and_large_parts() {
        let mut cfg = parse(&["--remote-backend", "s3", "--part-size", "1024"]);
        cfg.s3_bucket = None;
        assert!(cfg.validate().is_err());

        cfg.s3_bucket = Some("files".into());
        assert!(cfg.validate().is_err());

        cfg.part_size = S3_MIN_PART_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sweep_is_refused_with_memory_backend() {
        let cfg = parse(&["--remote-backend", "memory"]);
        assert!(cfg.validate_mode(RunMode::Sweep).is_err());
        assert!(cfg.validate_mode(RunMode::Serve).is_ok());
        assert!(cfg.validate_mode(RunMode::Migrate).is_ok());

        let cfg = parse(&["--remote-backend", "s3", "--s3-bucket", "files"]);
        assert!(cfg.validate_mode(RunMode::Sweep).is_ok());
    }

    #[test]
    fn derived_settings() {
        let mut cfg = parse(&["--retention-max-age-days", "2", "--offload-workers", "3"]);
        cfg.offload_retry_base_secs = 4;
        assert_eq!(cfg.retention_max_age(), Duration::from_secs(2 * 86_400));

        let offload = cfg.offload();
        assert_eq!(offload.max_workers, 3);
        assert_eq!(offload.retry_base, Duration::from_secs(4));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let mut cfg = parse(&[]);
        cfg.s3_secret_access_key = Some("hunter2".into());
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
