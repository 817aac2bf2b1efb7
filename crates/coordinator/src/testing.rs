//! In-process stand-in for the worker.

use std::collections::HashMap;
use std::sync::Mutex;

use bucketcache_protocol::constants::TRANSFER_FAILED;
use bucketcache_protocol::messages::{DownloadParams, DownloadResult, UploadParams, UploadResult};

use crate::{CallFuture, CoordinatorError, TransferClient};

/// Keeps objects in memory. Plain files are copied byte for byte; tar
/// uploads store the include list and tar downloads create the output
/// directory with an `extracted` marker.
#[derive(Default)]
pub struct FakeTransfers {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub downloads: Mutex<Vec<DownloadParams>>,
    pub uploads: Mutex<Vec<UploadParams>>,
    /// Uploads whose key contains this text fail.
    pub fail_uploads_matching: Option<String>,
    /// Every call fails as if the worker were gone.
    pub offline: bool,
}

impl FakeTransfers {
    pub fn insert(&self, path: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn do_download(&self, params: DownloadParams) -> Result<DownloadResult, CoordinatorError> {
        if self.offline {
            return Err(CoordinatorError::ChannelClosed);
        }
        self.downloads.lock().unwrap().push(params.clone());
        let Some(bytes) = self.object(&params.s3_path.to_string()) else {
            return Ok(DownloadResult { downloaded: false });
        };
        if params.untar {
            std::fs::create_dir_all(&params.output_path)?;
            std::fs::write(params.output_path.join("extracted"), &bytes)?;
        } else {
            if let Some(parent) = params.output_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&params.output_path, &bytes)?;
        }
        Ok(DownloadResult { downloaded: true })
    }

    fn do_upload(&self, params: UploadParams) -> Result<UploadResult, CoordinatorError> {
        if self.offline {
            return Err(CoordinatorError::ChannelClosed);
        }
        self.uploads.lock().unwrap().push(params.clone());
        let key = params.s3_path.to_string();
        if let Some(pattern) = &self.fail_uploads_matching {
            if key.contains(pattern.as_str()) {
                return Err(CoordinatorError::Rpc {
                    code: TRANSFER_FAILED,
                    message: "injected failure".into(),
                });
            }
        }
        if !params.overwrite {
            if let Some(existing) = self.object(&key) {
                return Ok(UploadResult {
                    uploaded: false,
                    size: Some(existing.len() as u64),
                });
            }
        }
        let bytes = if params.create_tar {
            params.include.join("\n").into_bytes()
        } else {
            std::fs::read(&params.input_path)?
        };
        let size = bytes.len() as u64;
        self.objects.lock().unwrap().insert(key, bytes);
        Ok(UploadResult {
            uploaded: true,
            size: Some(size),
        })
    }
}

impl TransferClient for FakeTransfers {
    fn download(&self, params: DownloadParams) -> CallFuture<'_, DownloadResult> {
        Box::pin(async move { self.do_download(params) })
    }

    fn upload(&self, params: UploadParams) -> CallFuture<'_, UploadResult> {
        Box::pin(async move { self.do_upload(params) })
    }
}
