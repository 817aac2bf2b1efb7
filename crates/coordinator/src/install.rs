//! Decorators that put the cache in front of the host's fetch and install
//! steps.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bucketcache_fingerprint::DependencyGraph;
use futures_util::future::join_all;

use crate::cache::{ArtifactCache, Restore};

/// Boxed future returned by the host capabilities.
pub type HostFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// A package archive the host wants on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    /// Checksum as recorded by the host, `[<version><variant>/]<hash>`.
    pub checksum: Option<String>,
    /// Where the archive must end up.
    pub path: PathBuf,
}

/// The host's "fetch one package archive" capability.
pub trait FetchPackage: Send + Sync {
    type Error: Send;

    fn fetch<'a>(&'a self, request: &'a PackageRequest) -> HostFuture<'a, (), Self::Error>;
}

/// Fetches through the package cache.
///
/// A file already on disk goes straight to the inner fetcher. Otherwise the
/// cache is tried first; on a miss the inner fetcher runs and the archive it
/// produced, if any, is published.
pub struct CachedFetcher<F, G: DependencyGraph> {
    inner: F,
    cache: Arc<ArtifactCache<G>>,
    hits: AtomicUsize,
}

impl<F, G> CachedFetcher<F, G>
where
    F: FetchPackage,
    G: DependencyGraph + Send,
{
    pub fn new(inner: F, cache: Arc<ArtifactCache<G>>) -> Self {
        Self {
            inner,
            cache,
            hits: AtomicUsize::new(0),
        }
    }

    /// Number of packages restored from the cache so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    async fn fetch_cached(&self, request: &PackageRequest) -> Result<(), F::Error> {
        let Some(checksum) = request.checksum.as_deref() else {
            return self.inner.fetch(request).await;
        };
        if request.path.exists() {
            return self.inner.fetch(request).await;
        }

        if self.cache.restore_package(checksum, &request.path).await == Restore::Hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.inner.fetch(request).await?;
        // Conditional packages are not always materialized.
        if request.path.exists() {
            self.cache.publish_package(checksum, &request.path).await;
        }
        Ok(())
    }
}

impl<F, G> FetchPackage for CachedFetcher<F, G>
where
    F: FetchPackage,
    G: DependencyGraph + Send,
{
    type Error = F::Error;

    fn fetch<'a>(&'a self, request: &'a PackageRequest) -> HostFuture<'a, (), Self::Error> {
        Box::pin(self.fetch_cached(request))
    }
}

/// Whether a package still needs its build scripts run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildDirective {
    Required,
    Skipped { reason: String },
}

/// What the host's installer did for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    pub package_location: PathBuf,
    /// `None` when the package has no build step.
    pub build: Option<BuildDirective>,
}

/// The host's "install one package" capability.
pub trait InstallPackage: Send + Sync {
    type Error: Send;

    fn install<'a>(&'a self, node: &'a str) -> HostFuture<'a, InstallResult, Self::Error>;
}

#[derive(Debug, Clone)]
struct PendingBuild {
    node: String,
    digest: String,
    location: PathBuf,
}

/// Installs through the build cache.
///
/// After the inner install, a package that needs a build is restored from
/// the cache and its build marked skipped, or queued for
/// [`publish_pending`](Self::publish_pending) once the host has built it.
pub struct CachedInstaller<I, G: DependencyGraph> {
    inner: I,
    cache: Arc<ArtifactCache<G>>,
    pending: Mutex<Vec<PendingBuild>>,
}

impl<I, G> CachedInstaller<I, G>
where
    I: InstallPackage,
    G: DependencyGraph + Send,
{
    pub fn new(inner: I, cache: Arc<ArtifactCache<G>>) -> Self {
        Self {
            inner,
            cache,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Number of builds waiting to be published.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn install_cached(&self, node: &str) -> Result<InstallResult, I::Error> {
        let result = self.inner.install(node).await?;
        if result.build != Some(BuildDirective::Required) {
            return Ok(result);
        }

        let digest = match self.cache.fingerprint(node, &[&result.package_location]) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(node, "cannot fingerprint package, building normally: {e}");
                return Ok(result);
            }
        };

        match self.cache.try_restore(&digest, &result.package_location).await {
            Restore::Hit => {
                tracing::debug!(node, "build restored from cache");
                Ok(InstallResult {
                    package_location: result.package_location,
                    build: Some(BuildDirective::Skipped {
                        reason: "restored from build cache".into(),
                    }),
                })
            }
            Restore::Miss => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(PendingBuild {
                        node: node.to_string(),
                        digest,
                        location: result.package_location.clone(),
                    });
                Ok(result)
            }
        }
    }

    /// Publishes every queued build for which `succeeded(node)` holds and
    /// returns how many objects were written. The queue is emptied.
    pub async fn publish_pending<S>(&self, succeeded: S) -> usize
    where
        S: Fn(&str) -> bool,
    {
        let pending = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let builds: Vec<_> = pending
            .into_iter()
            .filter(|build| {
                let ok = succeeded(&build.node);
                if !ok {
                    tracing::debug!(node = %build.node, "build failed, not publishing");
                }
                ok
            })
            .collect();

        let published = join_all(
            builds
                .iter()
                .map(|build| self.cache.publish(&build.digest, &build.location)),
        )
        .await;
        published.into_iter().filter(|uploaded| *uploaded).count()
    }
}

impl<I, G> InstallPackage for CachedInstaller<I, G>
where
    I: InstallPackage,
    G: DependencyGraph + Send,
{
    type Error = I::Error;

    fn install<'a>(&'a self, node: &'a str) -> HostFuture<'a, InstallResult, Self::Error> {
        Box::pin(self.install_cached(node))
    }
}
