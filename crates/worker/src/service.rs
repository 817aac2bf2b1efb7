use std::sync::Arc;

use bucketcache_protocol::constants::PONG;
use bucketcache_protocol::messages::{
    DownloadParams, DownloadResult, PingResult, UploadParams, UploadResult,
};
use bucketcache_storage::ObjectStore;
use tokio::sync::Semaphore;

use crate::WorkerError;
use crate::archive::{self, WriteOutcome};

/// Executes transfers against an object store under admission control.
///
/// Calls beyond a limit wait for a permit; they are never rejected.
pub struct TransferService {
    store: Arc<dyn ObjectStore>,
    downloads: Semaphore,
    uploads: Semaphore,
}

impl TransferService {
    pub fn new(store: Arc<dyn ObjectStore>, max_downloads: usize, max_uploads: usize) -> Self {
        Self {
            store,
            downloads: Semaphore::new(max_downloads),
            uploads: Semaphore::new(max_uploads),
        }
    }

    pub fn ping(&self) -> PingResult {
        PingResult {
            message: PONG.to_string(),
        }
    }

    /// Fetches an object. An absent object or a checksum mismatch is
    /// `downloaded: false`.
    pub async fn download(&self, params: DownloadParams) -> Result<DownloadResult, WorkerError> {
        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| WorkerError::ShuttingDown)?;

        let path = &params.s3_path;
        let Some(body) = self.store.get(path).await? else {
            tracing::debug!(%path, "object not found");
            return Ok(DownloadResult { downloaded: false });
        };
        let body = if params.decompress {
            archive::gunzip(body)
        } else {
            body
        };

        let output = &params.output_path;
        if params.untar {
            let stats = if params.merge {
                archive::extract_merge(body, output).await?
            } else {
                archive::extract_replace(body, output).await?
            };
            tracing::debug!(
                %path,
                output = %output.display(),
                unpacked = stats.unpacked,
                skipped = stats.skipped,
                "extracted archive"
            );
        } else {
            match archive::write_verified(body, output, params.checksum.as_deref()).await? {
                WriteOutcome::Written { bytes } => {
                    tracing::debug!(%path, output = %output.display(), bytes, "downloaded object");
                }
                WriteOutcome::ChecksumMismatch { expected, actual } => {
                    tracing::warn!(%path, %expected, %actual, "checksum mismatch, discarding download");
                    return Ok(DownloadResult { downloaded: false });
                }
            }
        }

        Ok(DownloadResult { downloaded: true })
    }

    /// Stores a file or directory. Without `overwrite`, an existing object is
    /// kept and reported as `uploaded: false`.
    pub async fn upload(&self, params: UploadParams) -> Result<UploadResult, WorkerError> {
        if !params.include.is_empty() && !params.create_tar {
            return Err(WorkerError::InvalidRequest(
                "include requires createTar".into(),
            ));
        }

        let _permit = self
            .uploads
            .acquire()
            .await
            .map_err(|_| WorkerError::ShuttingDown)?;

        let path = &params.s3_path;
        if !params.overwrite {
            if let Some(size) = self.store.head(path).await? {
                tracing::debug!(%path, size, "object exists, skipping upload");
                return Ok(UploadResult {
                    uploaded: false,
                    size: Some(size),
                });
            }
        }

        let input = &params.input_path;
        let body = if params.create_tar {
            if !tokio::fs::metadata(input).await?.is_dir() {
                return Err(WorkerError::InvalidRequest(format!(
                    "{} is not a directory",
                    input.display()
                )));
            }
            archive::tar_stream(input.clone(), params.include.clone())?
        } else {
            archive::open_file(input).await?
        };
        let body = if params.compress {
            archive::gzip(body)
        } else {
            body
        };

        self.store.put(path, body).await?;
        let size = self.store.head(path).await?;
        tracing::debug!(%path, input = %input.display(), size = ?size, "uploaded object");

        Ok(UploadResult {
            uploaded: true,
            size,
        })
    }
}
