//! Control-process side of bucketcache.
//!
//! Starts and supervises the transfer worker, multiplexes RPC calls over its
//! socket and builds the caching features on top: the manifest store, bulk
//! chunked archives, the host-facing [`ArtifactCache`] and the fetch/install
//! decorators.

pub mod bulk;
pub mod cache;
pub mod client;
pub mod config;
pub mod install;
pub mod metadata;
pub mod process;

#[cfg(test)]
pub(crate) mod testing;

pub use bulk::{BulkCache, BulkDownload, BulkUpload};
pub use cache::{ArtifactCache, Restore};
pub use client::RpcClient;
pub use config::CacheConfig;
pub use install::{
    BuildDirective, CachedFetcher, CachedInstaller, FetchPackage, InstallPackage, InstallResult,
    PackageRequest,
};
pub use metadata::{ManifestLookup, MetadataStore};
pub use process::{WorkerHandle, WorkerOptions, WorkerState};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bucketcache_fingerprint::FingerprintError;
use bucketcache_protocol::messages::{DownloadParams, DownloadResult, UploadParams, UploadResult};
use bucketcache_transfer::TransferError;

/// Boxed future returned by [`TransferClient`] methods.
pub type CallFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CoordinatorError>> + Send + 'a>>;

/// Download and upload capability of a transfer worker.
///
/// [`WorkerHandle`] is the production implementation.
pub trait TransferClient: Send + Sync {
    fn download(&self, params: DownloadParams) -> CallFuture<'_, DownloadResult>;
    fn upload(&self, params: UploadParams) -> CallFuture<'_, UploadResult>;
}

/// Errors produced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("connection to worker closed")]
    ChannelClosed,

    #[error("worker exited before becoming ready (code {code:?})")]
    WorkerExited { code: Option<i32> },

    #[error("worker not ready after {0:?}")]
    StartTimeout(Duration),

    #[error("worker is not running")]
    NotRunning,

    #[error("worker error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("response carried neither result nor error")]
    EmptyResponse,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            CoordinatorError::ChannelClosed.to_string(),
            "connection to worker closed"
        );
        assert_eq!(
            CoordinatorError::WorkerExited { code: Some(1) }.to_string(),
            "worker exited before becoming ready (code Some(1))"
        );
        let err = CoordinatorError::Rpc {
            code: -32000,
            message: "access denied".into(),
        };
        assert_eq!(err.to_string(), "worker error -32000: access denied");
    }
}
