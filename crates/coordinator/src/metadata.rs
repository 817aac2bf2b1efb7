//! Bulk manifests stored at `<bucket>/metadata/<cacheKey>`.
//!
//! All I/O goes through the worker via scratch files in the temp directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bucketcache_protocol::layout::metadata_key;
use bucketcache_protocol::messages::{DownloadParams, UploadParams};
use bucketcache_protocol::{Manifest, ObjectPath};

use crate::{CoordinatorError, TransferClient};

/// Result of looking up a manifest.
///
/// An empty file list is still `Found`. Transport failures are reported as
/// errors, not as `Absent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLookup {
    Found(Manifest),
    Absent,
}

pub struct MetadataStore {
    transfers: Arc<dyn TransferClient>,
    bucket: String,
    scratch_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(transfers: Arc<dyn TransferClient>, bucket: impl Into<String>) -> Self {
        Self {
            transfers,
            bucket: bucket.into(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Uses `dir` for scratch files instead of the temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    fn object_path(&self, cache_key: &str) -> ObjectPath {
        ObjectPath::new(&self.bucket, metadata_key(cache_key))
    }

    fn scratch_file(&self) -> PathBuf {
        self.scratch_dir
            .join(format!("bucketcache-manifest-{}.json", uuid::Uuid::new_v4()))
    }

    /// Writes `manifest`, replacing any previous one for `cache_key`.
    pub async fn save(&self, cache_key: &str, manifest: &Manifest) -> Result<(), CoordinatorError> {
        let scratch = self.scratch_file();
        tokio::fs::write(&scratch, serde_json::to_vec(manifest)?).await?;

        let result = self
            .transfers
            .upload(UploadParams {
                s3_path: self.object_path(cache_key),
                input_path: scratch.clone(),
                compress: false,
                create_tar: false,
                include: Vec::new(),
                overwrite: true,
            })
            .await;
        remove_scratch(&scratch).await;
        result?;

        tracing::debug!(
            cache_key,
            files = manifest.all_files.len(),
            "manifest saved"
        );
        Ok(())
    }

    /// Reads the manifest for `cache_key`.
    pub async fn get(&self, cache_key: &str) -> Result<ManifestLookup, CoordinatorError> {
        let scratch = self.scratch_file();
        let result = self.fetch(cache_key, &scratch).await;
        remove_scratch(&scratch).await;
        result
    }

    async fn fetch(&self, cache_key: &str, scratch: &Path) -> Result<ManifestLookup, CoordinatorError> {
        let result = self
            .transfers
            .download(DownloadParams {
                s3_path: self.object_path(cache_key),
                output_path: scratch.to_path_buf(),
                checksum: None,
                decompress: false,
                untar: false,
                merge: false,
            })
            .await?;
        if !result.downloaded {
            return Ok(ManifestLookup::Absent);
        }

        let raw = tokio::fs::read(scratch).await?;
        match serde_json::from_slice::<Manifest>(&raw) {
            Ok(manifest) => Ok(ManifestLookup::Found(manifest)),
            Err(e) => {
                tracing::warn!(cache_key, "ignoring malformed manifest: {e}");
                Ok(ManifestLookup::Absent)
            }
        }
    }
}

async fn remove_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!(path = %path.display(), "failed to remove scratch file: {e}"),
    }
}
