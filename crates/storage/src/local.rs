use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use bucketcache_protocol::ObjectPath;
use tokio::io::AsyncWriteExt;

use crate::{ObjectReader, ObjectStore, StorageError, StoreFuture};

/// Stores objects as plain files under `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_file(&self, path: &ObjectPath) -> Result<PathBuf, StorageError> {
        let mut file = self.root.join(checked_segment(path.bucket())?);
        for segment in path.key().split('/') {
            file.push(checked_segment(segment)?);
        }
        Ok(file)
    }
}

fn checked_segment(segment: &str) -> Result<&str, StorageError> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(segment),
        _ => Err(StorageError::InvalidKey(segment.to_string())),
    }
}

fn not_found_as_none<T>(result: io::Result<T>) -> Result<Option<T>, StorageError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl ObjectStore for LocalStore {
    fn put<'a>(&'a self, path: &'a ObjectPath, mut body: ObjectReader) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let target = self.object_file(path)?;
            let parent = target
                .parent()
                .ok_or_else(|| StorageError::InvalidKey(path.to_string()))?;
            tokio::fs::create_dir_all(parent).await?;

            let mut tmp_name = OsString::from(".");
            tmp_name.push(target.file_name().unwrap_or_default());
            tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
            let tmp = parent.join(tmp_name);

            let written = async {
                let mut file = tokio::fs::File::create(&tmp).await?;
                let n = tokio::io::copy(&mut body, &mut file).await?;
                file.flush().await?;
                file.sync_all().await?;
                tokio::fs::rename(&tmp, &target).await?;
                Ok::<u64, io::Error>(n)
            }
            .await;

            match written {
                Ok(bytes) => {
                    tracing::debug!(%path, bytes, "stored object");
                    Ok(())
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    Err(e.into())
                }
            }
        })
    }

    fn get<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectReader>> {
        Box::pin(async move {
            let file = self.object_file(path)?;
            let opened = not_found_as_none(tokio::fs::File::open(file).await)?;
            Ok(opened.map(|f| Box::pin(f) as ObjectReader))
        })
    }

    fn head<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move {
            let file = self.object_file(path)?;
            let meta = not_found_as_none(tokio::fs::metadata(file).await)?;
            Ok(meta.filter(|m| m.is_file()).map(|m| m.len()))
        })
    }
}
