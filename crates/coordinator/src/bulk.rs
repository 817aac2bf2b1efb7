//! Bulk mode: a whole directory of archives cached as a few balanced tar
//! chunks plus a manifest naming the current generation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bucketcache_protocol::layout::{archive_key, generation_label};
use bucketcache_protocol::messages::{DownloadParams, UploadParams};
use bucketcache_protocol::{Manifest, ManifestEntry, ObjectPath};
use bucketcache_transfer::{
    Chunk, FileEntry, ProgressAggregator, ProgressCallback, TransferError, plan, resolve_within,
};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::join_all;

use crate::metadata::{ManifestLookup, MetadataStore};
use crate::{CoordinatorError, TransferClient};

/// Outcome of [`BulkCache::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkDownload {
    /// No manifest exists yet for the cache key.
    NoManifest,
    Completed {
        chunks: usize,
        restored: usize,
        failed: usize,
    },
}

/// Outcome of [`BulkCache::upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkUpload {
    /// None of the given files exist; nothing was written.
    Empty,
    /// Every chunk was stored and the manifest replaced.
    Saved(Manifest),
    /// Some chunks failed; the previous manifest was left in place.
    Incomplete { failed: usize, chunks: usize },
}

pub struct BulkCache {
    transfers: Arc<dyn TransferClient>,
    metadata: MetadataStore,
    bucket: String,
    cache_key: String,
    archives_dir: PathBuf,
    chunk_count: usize,
    progress_interval: Option<Duration>,
}

impl BulkCache {
    pub fn new(
        transfers: Arc<dyn TransferClient>,
        bucket: impl Into<String>,
        cache_key: impl Into<String>,
        archives_dir: impl Into<PathBuf>,
        chunk_count: usize,
    ) -> Self {
        let bucket = bucket.into();
        Self {
            metadata: MetadataStore::new(transfers.clone(), bucket.clone()),
            transfers,
            bucket,
            cache_key: cache_key.into(),
            archives_dir: archives_dir.into(),
            chunk_count: chunk_count.max(1),
            progress_interval: None,
        }
    }

    /// Overrides the minimum interval between progress reports.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Joins key parts with `-`, e.g. project name and compression level.
    pub fn cache_key_from_parts<S: AsRef<str>>(parts: &[S]) -> String {
        parts
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn archives_dir(&self) -> &Path {
        &self.archives_dir
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Restores the current generation into the archives directory.
    ///
    /// Chunks are extracted in place, keeping files already present. At most
    /// `chunk_count` chunks are in flight. A failed chunk is logged and
    /// counted; only a failed manifest lookup is an error.
    pub async fn download(&self, on_progress: ProgressCallback) -> Result<BulkDownload, CoordinatorError> {
        tokio::fs::create_dir_all(&self.archives_dir).await?;

        let manifest = match self.metadata.get(&self.cache_key).await? {
            ManifestLookup::Found(m) => m,
            ManifestLookup::Absent => {
                tracing::warn!(cache_key = %self.cache_key, "no manifest, upload first");
                return Ok(BulkDownload::NoManifest);
            }
        };

        let progress = ProgressAggregator::new(manifest.total_size(), self.progress_interval, on_progress);
        let chunks = manifest.all_files.len();
        tracing::info!(
            cache_key = %self.cache_key,
            chunks,
            bytes = manifest.total_size(),
            "downloading bulk cache"
        );

        let outcomes: Vec<bool> = futures_util::stream::iter(&manifest.all_files)
            .map(|entry| self.download_chunk(entry, &progress))
            .buffer_unordered(self.chunk_count)
            .collect()
            .await;
        progress.finish();

        let restored = outcomes.iter().filter(|ok| **ok).count();
        Ok(BulkDownload::Completed {
            chunks,
            restored,
            failed: chunks - restored,
        })
    }

    async fn download_chunk(&self, entry: &ManifestEntry, progress: &ProgressAggregator) -> bool {
        let params = DownloadParams {
            s3_path: ObjectPath::new(&self.bucket, &entry.key),
            output_path: self.archives_dir.clone(),
            checksum: None,
            decompress: false,
            untar: true,
            merge: true,
        };
        match self.transfers.download(params).await {
            Ok(result) if result.downloaded => {
                progress.record(entry.size);
                true
            }
            Ok(_) => {
                tracing::warn!(key = %entry.key, "chunk listed in manifest is missing");
                false
            }
            Err(e) => {
                tracing::warn!(key = %entry.key, "chunk download failed: {e}");
                false
            }
        }
    }

    /// Archives `files` as a new generation.
    ///
    /// Paths may be absolute or relative to the archives directory; files
    /// that no longer exist are skipped. The manifest is replaced only if
    /// every chunk was stored. Superseded generations are left untouched.
    pub async fn upload<P: AsRef<Path>>(
        &self,
        files: &[P],
        on_progress: ProgressCallback,
    ) -> Result<BulkUpload, CoordinatorError> {
        let mut existing = Vec::with_capacity(files.len());
        for file in files {
            let relative = resolve_within(&self.archives_dir, file.as_ref())?;
            if tokio::fs::try_exists(self.archives_dir.join(&relative)).await? {
                existing.push(relative);
            }
        }
        if existing.is_empty() {
            tracing::info!(cache_key = %self.cache_key, "no files to upload");
            return Ok(BulkUpload::Empty);
        }

        let entries = FileEntry::stat_all(&self.archives_dir, &existing).await?;
        let chunks = plan(entries, self.chunk_count);
        let uploaded = Utc::now();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let generation = generation_label(&uploaded, &nonce[..8]);
        let total: u64 = chunks.iter().map(|c| c.size).sum();
        tracing::info!(
            cache_key = %self.cache_key,
            %generation,
            files = existing.len(),
            chunks = chunks.len(),
            bytes = total,
            "uploading bulk cache"
        );

        let progress = ProgressAggregator::new(total, self.progress_interval, on_progress);
        let results = join_all(
            chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| self.upload_chunk(&generation, index, chunk, &progress)),
        )
        .await;
        progress.finish();

        let chunk_total = results.len();
        let mut all_files = Vec::with_capacity(chunk_total);
        let mut failed = 0;
        for result in results {
            match result {
                Ok(entry) => all_files.push(entry),
                Err(e) => {
                    tracing::warn!("chunk upload failed: {e}");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            tracing::warn!(
                cache_key = %self.cache_key,
                failed,
                chunks = chunk_total,
                "bulk upload incomplete, keeping previous manifest"
            );
            return Ok(BulkUpload::Incomplete {
                failed,
                chunks: chunk_total,
            });
        }

        let manifest = Manifest { all_files, uploaded };
        self.metadata.save(&self.cache_key, &manifest).await?;
        Ok(BulkUpload::Saved(manifest))
    }

    async fn upload_chunk(
        &self,
        generation: &str,
        index: usize,
        chunk: &Chunk,
        progress: &ProgressAggregator,
    ) -> Result<ManifestEntry, CoordinatorError> {
        let include = chunk
            .files
            .iter()
            .map(|f| {
                f.path
                    .to_str()
                    .map(str::to_owned)
                    .ok_or_else(|| TransferError::InvalidPath(f.path.display().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key = archive_key(&self.cache_key, generation, index);
        let result = self
            .transfers
            .upload(UploadParams {
                s3_path: ObjectPath::new(&self.bucket, &key),
                input_path: self.archives_dir.clone(),
                compress: false,
                create_tar: true,
                include,
                overwrite: true,
            })
            .await?;
        progress.record(chunk.size);

        let size = result.size.unwrap_or_else(|| {
            tracing::warn!(%key, "no size reported for chunk");
            0
        });
        Ok(ManifestEntry { key, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransfers;
    use bucketcache_transfer::BulkProgress;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<BulkProgress>>>, ProgressCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |p: BulkProgress| sink.lock().unwrap().push(p)))
    }

    fn populate(dir: &Path, files: &[(&str, usize)]) {
        for (name, size) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, vec![b'x'; *size]).unwrap();
        }
    }

    #[test]
    fn cache_key_joins_parts() {
        assert_eq!(BulkCache::cache_key_from_parts(&["@acme/app", "0"]), "@acme/app-0");
    }

    #[tokio::test]
    async fn upload_plans_chunks_and_saves_manifest() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        populate(
            dir.path(),
            &[("a.zip", 10), ("b.zip", 9), ("c.zip", 8), ("d.zip", 7), ("e.zip", 6), ("f.zip", 5)],
        );
        let bulk = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 3);

        let files: Vec<PathBuf> = ["a.zip", "b.zip", "c.zip", "d.zip", "e.zip", "f.zip", "gone.zip"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();
        let (seen, callback) = recorder();
        let outcome = bulk.upload(&files, callback).await.unwrap();

        let manifest = match outcome {
            BulkUpload::Saved(manifest) => manifest,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(manifest.all_files.len(), 3);
        let stamp = manifest.uploaded.format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let generation = manifest.all_files[0].key.split('/').nth(2).unwrap().to_string();
        assert!(generation.starts_with(&format!("{stamp}-")));
        for (i, entry) in manifest.all_files.iter().enumerate() {
            assert_eq!(entry.key, format!("archives/app-0/{generation}/{i}.tar"));
        }

        let mut includes: Vec<Vec<String>> = fake
            .uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.create_tar)
            .map(|u| {
                assert_eq!(u.input_path, dir.path());
                u.include.clone()
            })
            .collect();
        includes.sort();
        assert_eq!(
            includes,
            vec![
                vec!["a.zip".to_string(), "f.zip".to_string()],
                vec!["b.zip".to_string(), "e.zip".to_string()],
                vec!["c.zip".to_string(), "d.zip".to_string()],
            ]
        );

        assert!(fake.object("s3://cache/metadata/app-0").is_some());
        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.transferred, 45);
        assert_eq!(last.total, 45);
    }

    #[tokio::test]
    async fn simultaneous_uploads_never_share_chunk_keys() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &[("a.zip", 4), ("b.zip", 3)]);
        let first = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 2);
        let second = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 2);

        let (_a, on_first) = recorder();
        let (_b, on_second) = recorder();
        let (x, y) = tokio::join!(
            first.upload(&["a.zip", "b.zip"], on_first),
            second.upload(&["a.zip", "b.zip"], on_second),
        );
        let (BulkUpload::Saved(x), BulkUpload::Saved(y)) = (x.unwrap(), y.unwrap()) else {
            panic!("both uploads should be saved");
        };
        for entry in &x.all_files {
            assert!(y.all_files.iter().all(|other| other.key != entry.key));
        }
    }

    #[tokio::test]
    async fn failed_chunk_keeps_previous_manifest() {
        let fake = Arc::new(FakeTransfers {
            fail_uploads_matching: Some("/1.tar".into()),
            ..Default::default()
        });
        fake.insert("s3://cache/metadata/app-0", b"previous");
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &[("a.zip", 3), ("b.zip", 2)]);
        let bulk = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 2);

        let (_seen, callback) = recorder();
        let outcome = bulk.upload(&["a.zip", "b.zip"], callback).await.unwrap();
        assert_eq!(outcome, BulkUpload::Incomplete { failed: 1, chunks: 2 });
        assert_eq!(fake.object("s3://cache/metadata/app-0").unwrap(), b"previous");
    }

    #[tokio::test]
    async fn upload_of_nothing_writes_nothing() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        let bulk = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 4);
        let (_seen, callback) = recorder();
        let outcome = bulk.upload(&["missing.zip"], callback).await.unwrap();
        assert_eq!(outcome, BulkUpload::Empty);
        assert_eq!(fake.upload_count(), 0);
    }

    #[tokio::test]
    async fn files_outside_archives_dir_are_rejected() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        populate(other.path(), &[("x.zip", 1)]);
        let bulk = BulkCache::new(fake, "cache", "app-0", dir.path(), 4);
        let (_seen, callback) = recorder();
        let err = bulk
            .upload(&[other.path().join("x.zip")], callback)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Transfer(_)));
    }

    #[tokio::test]
    async fn download_without_manifest() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        let archives = dir.path().join("cache");
        let bulk = BulkCache::new(fake.clone(), "cache", "app-0", &archives, 4);
        let (seen, callback) = recorder();
        assert_eq!(bulk.download(callback).await.unwrap(), BulkDownload::NoManifest);
        assert!(archives.is_dir());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(fake.downloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn download_merges_every_chunk() {
        let fake = Arc::new(FakeTransfers::default());
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &[("a.zip", 4), ("b.zip", 3), ("c.zip", 2)]);
        let bulk = BulkCache::new(fake.clone(), "cache", "app-0", dir.path(), 2);
        let (_seen, callback) = recorder();
        let BulkUpload::Saved(manifest) = bulk.upload(&["a.zip", "b.zip", "c.zip"], callback).await.unwrap()
        else {
            panic!("upload did not complete");
        };
        // Drop one chunk so the download reports it.
        let lost = format!("s3://cache/{}", manifest.all_files[1].key);
        fake.objects.lock().unwrap().remove(&lost);

        let restore_dir = tempfile::tempdir().unwrap();
        let restore = BulkCache::new(fake.clone(), "cache", "app-0", restore_dir.path(), 2);
        let (seen, callback) = recorder();
        let outcome = restore.download(callback).await.unwrap();
        assert_eq!(
            outcome,
            BulkDownload::Completed {
                chunks: 2,
                restored: 1,
                failed: 1
            }
        );

        let downloads = fake.downloads.lock().unwrap();
        let chunk_downloads: Vec<_> = downloads.iter().filter(|d| d.untar).collect();
        assert_eq!(chunk_downloads.len(), 2);
        assert!(chunk_downloads.iter().all(|d| d.merge && !d.decompress));
        assert!(chunk_downloads.iter().all(|d| d.output_path == restore_dir.path()));

        let last = *seen.lock().unwrap().last().unwrap();
        assert_eq!(last.total, manifest.total_size());
        assert_eq!(last.transferred, manifest.all_files[0].size);
    }
}
