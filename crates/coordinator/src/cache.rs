//! Host-facing cache: fingerprints, build output archives and package
//! archives.
//!
//! Every storage failure degrades to a miss. If the worker cannot be started
//! the cache is disabled for the run and behaves as permanently empty.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bucketcache_fingerprint::{
    CacheKey, DependencyGraph, FingerprintError, Fingerprinter, GlobalHash, PlatformTriple,
};
use bucketcache_protocol::ObjectPath;
use bucketcache_protocol::layout::{build_key, package_key};
use bucketcache_protocol::messages::{DownloadParams, UploadParams};

use crate::bulk::BulkCache;
use crate::config::CacheConfig;
use crate::process::{WorkerHandle, WorkerOptions};
use crate::TransferClient;

/// Outcome of a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restore {
    Hit,
    Miss,
}

impl Restore {
    pub fn is_hit(self) -> bool {
        self == Restore::Hit
    }
}

pub struct ArtifactCache<G: DependencyGraph> {
    transfers: Option<Arc<dyn TransferClient>>,
    worker: Option<Arc<WorkerHandle>>,
    fingerprinter: Mutex<Fingerprinter<G>>,
    config: CacheConfig,
}

impl<G: DependencyGraph> ArtifactCache<G> {
    /// Starts a worker for `config`.
    ///
    /// A worker that fails to become ready is logged and yields a disabled
    /// cache.
    pub async fn connect(config: CacheConfig, graph: G) -> Self {
        let options = WorkerOptions::from_config(&config);
        let worker_config = config.worker_config(PathBuf::new());
        match WorkerHandle::start(&options, worker_config).await {
            Ok(worker) => {
                let worker = Arc::new(worker);
                let mut cache = Self::with_transfers(worker.clone(), config, graph);
                cache.worker = Some(worker);
                cache
            }
            Err(e) => {
                tracing::warn!("cache disabled, worker unavailable: {e}");
                Self::disabled(config, graph)
            }
        }
    }

    /// A cache backed by `transfers`.
    pub fn with_transfers(transfers: Arc<dyn TransferClient>, config: CacheConfig, graph: G) -> Self {
        Self {
            transfers: Some(transfers),
            worker: None,
            fingerprinter: Mutex::new(Fingerprinter::new(graph, global_hash(&config))),
            config,
        }
    }

    /// A cache where every restore misses and every publish is skipped.
    pub fn disabled(config: CacheConfig, graph: G) -> Self {
        Self {
            transfers: None,
            worker: None,
            fingerprinter: Mutex::new(Fingerprinter::new(graph, global_hash(&config))),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transfers.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build fingerprint of `node` installed at `locations`.
    pub fn fingerprint<P: AsRef<Path>>(
        &self,
        node: &str,
        locations: &[P],
    ) -> Result<String, FingerprintError> {
        self.fingerprinter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .build_hash(node, locations)
    }

    /// Restores the build output stored under `digest` into `destination`,
    /// replacing its contents.
    pub async fn try_restore(&self, digest: &str, destination: &Path) -> Restore {
        let Some(transfers) = self.fetching() else {
            return Restore::Miss;
        };
        let params = DownloadParams {
            s3_path: ObjectPath::new(&self.config.bucket, build_key(digest)),
            output_path: destination.to_path_buf(),
            checksum: None,
            decompress: true,
            untar: true,
            merge: false,
        };
        self.restore(transfers, params).await
    }

    /// Stores `source` as the build output for `digest`. Returns `true` if
    /// a new object was written.
    pub async fn publish(&self, digest: &str, source: &Path) -> bool {
        let Some(transfers) = self.uploading() else {
            return false;
        };
        let params = UploadParams {
            s3_path: ObjectPath::new(&self.config.bucket, build_key(digest)),
            input_path: source.to_path_buf(),
            compress: true,
            create_tar: true,
            include: Vec::new(),
            overwrite: false,
        };
        self.store(transfers, params).await
    }

    /// Restores the package archive for `checksum` to `path`, verifying its
    /// SHA-512.
    pub async fn restore_package(&self, checksum: &str, path: &Path) -> Restore {
        let Some(transfers) = self.fetching() else {
            return Restore::Miss;
        };
        let key = CacheKey::parse(checksum);
        let params = DownloadParams {
            s3_path: self.package_path(&key),
            output_path: path.to_path_buf(),
            checksum: Some(key.hash().to_string()),
            decompress: self.config.compress_packages,
            untar: false,
            merge: false,
        };
        self.restore(transfers, params).await
    }

    /// Stores the package archive at `path` under `checksum`.
    pub async fn publish_package(&self, checksum: &str, path: &Path) -> bool {
        let Some(transfers) = self.uploading() else {
            return false;
        };
        let key = CacheKey::parse(checksum);
        let params = UploadParams {
            s3_path: self.package_path(&key),
            input_path: path.to_path_buf(),
            compress: self.config.compress_packages,
            create_tar: false,
            include: Vec::new(),
            overwrite: false,
        };
        self.store(transfers, params).await
    }

    /// Bulk cache for `cache_key` over `archives_dir`, or `None` when
    /// disabled.
    pub fn bulk(&self, cache_key: impl Into<String>, archives_dir: impl Into<PathBuf>) -> Option<BulkCache> {
        let transfers = self.transfers.clone()?;
        Some(BulkCache::new(
            transfers,
            self.config.bucket.clone(),
            cache_key,
            archives_dir,
            self.config.chunk_count,
        ))
    }

    /// Stops the worker, if this cache started one.
    pub fn stop(&self) {
        if let Some(worker) = &self.worker {
            worker.stop();
        }
    }

    fn fetching(&self) -> Option<&Arc<dyn TransferClient>> {
        self.transfers.as_ref().filter(|_| self.config.should_fetch)
    }

    fn uploading(&self) -> Option<&Arc<dyn TransferClient>> {
        self.transfers.as_ref().filter(|_| self.config.should_upload)
    }

    fn package_path(&self, key: &CacheKey) -> ObjectPath {
        ObjectPath::new(
            &self.config.bucket,
            package_key(key.hash(), self.config.compress_packages),
        )
    }

    async fn restore(&self, transfers: &Arc<dyn TransferClient>, params: DownloadParams) -> Restore {
        let path = params.s3_path.clone();
        match transfers.download(params).await {
            Ok(result) if result.downloaded => {
                tracing::debug!(%path, "cache hit");
                Restore::Hit
            }
            Ok(_) => {
                tracing::debug!(%path, "cache miss");
                Restore::Miss
            }
            Err(e) => {
                tracing::warn!(%path, "restore failed, treating as miss: {e}");
                Restore::Miss
            }
        }
    }

    async fn store(&self, transfers: &Arc<dyn TransferClient>, params: UploadParams) -> bool {
        let path = params.s3_path.clone();
        match transfers.upload(params).await {
            Ok(result) => {
                tracing::debug!(%path, uploaded = result.uploaded, size = ?result.size, "published");
                result.uploaded
            }
            Err(e) => {
                tracing::warn!(%path, "publish failed: {e}");
                false
            }
        }
    }
}

fn global_hash(config: &CacheConfig) -> GlobalHash {
    config
        .global_extras
        .iter()
        .fold(GlobalHash::builder(&PlatformTriple::current()), |b, extra| {
            b.extra(extra)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransfers;
    use bucketcache_fingerprint::{PackageGraph, PackageNode, sha512_hex};

    fn graph() -> PackageGraph {
        [
            PackageNode::new("app", ["lib"]),
            PackageNode::new("lib", Vec::<String>::new()),
        ]
        .into_iter()
        .collect()
    }

    fn cache(fake: &Arc<FakeTransfers>, config: CacheConfig) -> ArtifactCache<PackageGraph> {
        ArtifactCache::with_transfers(fake.clone(), config, graph())
    }

    #[tokio::test]
    async fn build_output_round_trip() {
        let fake = Arc::new(FakeTransfers::default());
        let cache = cache(&fake, CacheConfig::new("cache"));
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("node_modules/lib");

        let digest = cache.fingerprint("lib", &[&location]).unwrap();
        assert_eq!(cache.try_restore(&digest, &location).await, Restore::Miss);

        std::fs::create_dir_all(&location).unwrap();
        assert!(cache.publish(&digest, &location).await);
        assert!(!cache.publish(&digest, &location).await);

        let upload = fake.uploads.lock().unwrap()[0].clone();
        assert_eq!(upload.s3_path.key(), format!("{digest}.tar.gz"));
        assert!(upload.create_tar && upload.compress && !upload.overwrite);

        assert_eq!(cache.try_restore(&digest, &location).await, Restore::Hit);
        let download = fake.downloads.lock().unwrap().last().cloned().unwrap();
        assert!(download.untar && download.decompress && !download.merge);
    }

    #[tokio::test]
    async fn fingerprint_depends_on_location_and_extras() {
        let fake = Arc::new(FakeTransfers::default());
        let plain = cache(&fake, CacheConfig::new("cache"));
        let mut config = CacheConfig::new("cache");
        config.global_extras = vec!["node-20".into()];
        let extra = cache(&fake, config);

        let a = plain.fingerprint("app", &["/a"]).unwrap();
        assert_eq!(a, plain.fingerprint("app", &["/a"]).unwrap());
        assert_ne!(a, plain.fingerprint("app", &["/b"]).unwrap());
        assert_ne!(a, extra.fingerprint("app", &["/a"]).unwrap());
        assert!(matches!(
            plain.fingerprint("ghost", &["/a"]),
            Err(FingerprintError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn package_archive_uses_trailing_hash() {
        let fake = Arc::new(FakeTransfers::default());
        let cache = cache(&fake, CacheConfig::new("cache"));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("left-pad.zip");
        std::fs::write(&path, b"zip bytes").unwrap();
        let hash = sha512_hex(b"zip bytes");
        let checksum = format!("10c0/{hash}");

        assert!(cache.publish_package(&checksum, &path).await);
        assert!(fake.object(&format!("s3://cache/{hash}.zip")).is_some());

        std::fs::remove_file(&path).unwrap();
        assert_eq!(cache.restore_package(&checksum, &path).await, Restore::Hit);
        let download = fake.downloads.lock().unwrap().last().cloned().unwrap();
        assert_eq!(download.checksum.as_deref(), Some(hash.as_str()));
        assert!(!download.decompress);
        assert_eq!(std::fs::read(&path).unwrap(), b"zip bytes");
    }

    #[tokio::test]
    async fn compressed_packages_use_gz_key() {
        let fake = Arc::new(FakeTransfers::default());
        let mut config = CacheConfig::new("cache");
        config.compress_packages = true;
        let cache = cache(&fake, config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        std::fs::write(&path, b"zip").unwrap();

        assert!(cache.publish_package("abc", &path).await);
        let upload = fake.uploads.lock().unwrap()[0].clone();
        assert_eq!(upload.s3_path.key(), "abc.zip.gz");
        assert!(upload.compress);
    }

    #[tokio::test]
    async fn disabled_cache_misses_and_skips() {
        let cache = ArtifactCache::disabled(CacheConfig::new("cache"), graph());
        let dir = tempfile::tempdir().unwrap();
        assert!(!cache.is_enabled());
        assert_eq!(cache.try_restore("abc", dir.path()).await, Restore::Miss);
        assert!(!cache.publish("abc", dir.path()).await);
        assert_eq!(cache.restore_package("abc", dir.path()).await, Restore::Miss);
        assert!(cache.bulk("app-0", dir.path()).is_none());
        assert!(cache.fingerprint("app", &[dir.path()]).is_ok());
    }

    #[tokio::test]
    async fn fetch_and_upload_switches() {
        let fake = Arc::new(FakeTransfers::default());
        fake.insert("s3://cache/abc.tar.gz", b"tar");
        let mut config = CacheConfig::new("cache");
        config.should_fetch = false;
        config.should_upload = false;
        let cache = cache(&fake, config);
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(cache.try_restore("abc", dir.path()).await, Restore::Miss);
        assert!(!cache.publish("def", dir.path()).await);
        assert!(fake.downloads.lock().unwrap().is_empty());
        assert_eq!(fake.upload_count(), 0);
    }

    #[tokio::test]
    async fn transport_errors_degrade_to_miss() {
        let fake = Arc::new(FakeTransfers {
            offline: true,
            ..Default::default()
        });
        let cache = cache(&fake, CacheConfig::new("cache"));
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cache.try_restore("abc", dir.path()).await, Restore::Miss);
        assert!(!cache.publish("abc", dir.path()).await);
    }

    #[tokio::test]
    async fn unstartable_worker_disables_cache() {
        let mut config = CacheConfig::new("cache");
        config.worker_program = "/nonexistent/bucketcache-worker".into();
        let cache = ArtifactCache::connect(config, graph()).await;
        assert!(!cache.is_enabled());
    }
}
