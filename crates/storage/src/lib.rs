//! Object storage capability used by the transfer worker.
//!
//! Backends expose three operations over `s3://bucket/key` paths: streaming
//! put, streaming get and a size-only head. Absence is a normal `None`
//! result, never an error.

mod local;
mod memory;
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bucketcache_protocol::{ObjectPath, StorageBackend, WorkerConfig};
use tokio::io::AsyncRead;

/// Streaming object body.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// A boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 {operation} failed for {path}: {message}")]
    S3 {
        operation: &'static str,
        path: String,
        message: String,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// Minimal object storage client.
pub trait ObjectStore: Send + Sync + 'static {
    /// Streams `body` into the object at `path`, replacing any existing one.
    fn put<'a>(&'a self, path: &'a ObjectPath, body: ObjectReader) -> StoreFuture<'a, ()>;

    /// Opens the object at `path`, or `None` if it does not exist.
    fn get<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectReader>>;

    /// Size of the object at `path`, or `None` if it does not exist.
    fn head<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<u64>>;
}

/// Builds the backend selected by the worker configuration.
pub async fn open_store(config: &WorkerConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match &config.backend {
        StorageBackend::S3 => {
            let store = S3Store::connect(
                config.region.clone(),
                &config.credentials,
                config.endpoint_url.clone(),
            )
            .await;
            tracing::info!(region = ?config.region, bucket = %config.bucket, "using S3 backend");
            Ok(Arc::new(store))
        }
        StorageBackend::Local { root } => {
            tracing::info!(root = %root.display(), "using local directory backend");
            Ok(Arc::new(LocalStore::new(root.clone())))
        }
    }
}
