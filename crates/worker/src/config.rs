use bucketcache_protocol::constants::WORKER_CONFIG_ENV;
use bucketcache_protocol::{StorageBackend, WorkerConfig};

use crate::WorkerError;

/// Reads the configuration blob from `BUCKETCACHE_WORKER_CONFIG`.
pub fn load_from_env() -> Result<WorkerConfig, WorkerError> {
    load_with(|key| std::env::var(key).ok())
}

/// Reads and validates the configuration using `lookup` for environment
/// access.
pub fn load_with<F>(lookup: F) -> Result<WorkerConfig, WorkerError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(WORKER_CONFIG_ENV).ok_or(WorkerError::MissingConfig(WORKER_CONFIG_ENV))?;
    let config: WorkerConfig = serde_json::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

/// Rejects configurations the worker cannot serve.
pub fn validate(config: &WorkerConfig) -> Result<(), WorkerError> {
    if config.socket_path.as_os_str().is_empty() {
        return Err(WorkerError::InvalidConfig("socketPath is empty".into()));
    }
    if config.max_download_concurrency == 0 {
        return Err(WorkerError::InvalidConfig(
            "maxDownloadConcurrency must be at least 1".into(),
        ));
    }
    if config.max_upload_concurrency == 0 {
        return Err(WorkerError::InvalidConfig(
            "maxUploadConcurrency must be at least 1".into(),
        ));
    }
    if config.bucket.is_empty() {
        return Err(WorkerError::InvalidConfig("bucket is empty".into()));
    }
    if matches!(config.backend, StorageBackend::S3)
        && config.region.as_deref().is_none_or(str::is_empty)
    {
        return Err(WorkerError::InvalidConfig(
            "region is required for the S3 backend".into(),
        ));
    }
    Ok(())
}
