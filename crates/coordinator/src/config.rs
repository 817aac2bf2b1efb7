use std::path::{Path, PathBuf};
use std::time::Duration;

use bucketcache_protocol::constants::{
    DEFAULT_CHUNK_COUNT, DEFAULT_MAX_DOWNLOAD_CONCURRENCY, DEFAULT_MAX_UPLOAD_CONCURRENCY,
    PROBE_INTERVAL, STARTUP_TIMEOUT,
};
use bucketcache_protocol::{CredentialsSource, StorageBackend, WorkerConfig};
use serde::{Deserialize, Serialize};

use crate::CoordinatorError;

/// Overrides `shouldFetch`.
pub const SHOULD_FETCH_ENV: &str = "BUCKETCACHE_SHOULD_FETCH";

/// Overrides `shouldUpload`.
pub const SHOULD_UPLOAD_ENV: &str = "BUCKETCACHE_SHOULD_UPLOAD";

/// Name of the worker executable looked up on `PATH` by default.
pub const DEFAULT_WORKER_PROGRAM: &str = "bucketcache-worker";

/// Cache settings read by the control process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsSource,
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// Number of chunks, and parallel transfers, in bulk mode.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
    #[serde(default = "default_download_concurrency")]
    pub max_download_concurrency: usize,
    #[serde(default = "default_upload_concurrency")]
    pub max_upload_concurrency: usize,

    #[serde(default = "default_true")]
    pub should_fetch: bool,
    #[serde(default = "default_true")]
    pub should_upload: bool,
    /// Package archives are stored gzipped (`<hash>.zip.gz`).
    #[serde(default)]
    pub compress_packages: bool,
    /// Extra inputs mixed into every build fingerprint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_extras: Vec<String>,

    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_args: Vec<String>,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

fn default_chunk_count() -> usize {
    DEFAULT_CHUNK_COUNT
}

fn default_download_concurrency() -> usize {
    DEFAULT_MAX_DOWNLOAD_CONCURRENCY
}

fn default_upload_concurrency() -> usize {
    DEFAULT_MAX_UPLOAD_CONCURRENCY
}

fn default_true() -> bool {
    true
}

fn default_worker_program() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_PROGRAM)
}

fn default_probe_interval_ms() -> u64 {
    PROBE_INTERVAL.as_millis() as u64
}

fn default_startup_timeout_ms() -> u64 {
    STARTUP_TIMEOUT.as_millis() as u64
}

impl CacheConfig {
    /// Creates a configuration with defaults for everything but the bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            credentials: CredentialsSource::default(),
            backend: StorageBackend::default(),
            endpoint_url: None,
            chunk_count: DEFAULT_CHUNK_COUNT,
            max_download_concurrency: DEFAULT_MAX_DOWNLOAD_CONCURRENCY,
            max_upload_concurrency: DEFAULT_MAX_UPLOAD_CONCURRENCY,
            should_fetch: true,
            should_upload: true,
            compress_packages: false,
            global_extras: Vec::new(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            probe_interval_ms: default_probe_interval_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }

    /// Loads a JSON file and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, CoordinatorError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load) with `lookup` for environment access.
    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self, CoordinatorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = std::fs::read_to_string(path)?;
        let mut config: CacheConfig = serde_json::from_str(&raw)?;
        config.apply_env(lookup)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), bucket = %config.bucket, "cache configuration loaded");
        Ok(config)
    }

    /// Applies `BUCKETCACHE_SHOULD_FETCH` and `BUCKETCACHE_SHOULD_UPLOAD`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CoordinatorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(SHOULD_FETCH_ENV) {
            self.should_fetch = parse_flag(SHOULD_FETCH_ENV, &v)?;
        }
        if let Some(v) = lookup(SHOULD_UPLOAD_ENV) {
            self.should_upload = parse_flag(SHOULD_UPLOAD_ENV, &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.bucket.is_empty() {
            return Err(CoordinatorError::InvalidConfig("bucket is empty".into()));
        }
        if self.chunk_count == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "chunkCount must be at least 1".into(),
            ));
        }
        if self.max_download_concurrency == 0 || self.max_upload_concurrency == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "transfer concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Builds the blob handed to a worker listening on `socket_path`.
    pub fn worker_config(&self, socket_path: PathBuf) -> WorkerConfig {
        WorkerConfig {
            socket_path,
            max_download_concurrency: self.max_download_concurrency,
            max_upload_concurrency: self.max_upload_concurrency,
            region: self.region.clone(),
            credentials: self.credentials.clone(),
            bucket: self.bucket.clone(),
            backend: self.backend.clone(),
            endpoint_url: self.endpoint_url.clone(),
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, CoordinatorError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(CoordinatorError::InvalidConfig(format!(
            "{name} must be true or false, got {other:?}"
        ))),
    }
}
