//! Transfer worker.
//!
//! A long-lived process that owns all object storage I/O for a cache run.
//! It listens on a Unix domain socket, speaks newline-delimited JSON-RPC and
//! bounds concurrent downloads and uploads with separate semaphores.

pub mod archive;
pub mod config;
mod connection;
mod handler;
mod server;
mod service;

pub use handler::handle_line;
pub use server::WorkerServer;
pub use service::TransferService;

use std::sync::Arc;

use bucketcache_protocol::WorkerConfig;
use bucketcache_storage::{StorageError, open_store};
use bucketcache_transfer::TransferError;
use tokio_util::sync::CancellationToken;

/// Outgoing response buffer per connection.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("environment variable {0} is not set")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker is shutting down")]
    ShuttingDown,
}

/// Serves `config` until `cancel` fires.
pub async fn run(config: WorkerConfig, cancel: CancellationToken) -> Result<(), WorkerError> {
    let store = open_store(&config).await?;
    let service = Arc::new(TransferService::new(
        store,
        config.max_download_concurrency,
        config.max_upload_concurrency,
    ));
    tracing::info!(
        bucket = %config.bucket,
        max_downloads = config.max_download_concurrency,
        max_uploads = config.max_upload_concurrency,
        "transfer service ready"
    );

    WorkerServer::new(config.socket_path, service, cancel)
        .run()
        .await
}
