use std::path::{Path, PathBuf};

use crate::TransferError;
use crate::validation::resolve_within;

/// A file scheduled for a bulk transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the archive root.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Stats every path and returns entries relative to `root`.
    ///
    /// Paths may be absolute or relative to `root`. Fails on the first path
    /// that lies outside `root` or cannot be stat'ed.
    pub async fn stat_all<P: AsRef<Path>>(
        root: &Path,
        paths: &[P],
    ) -> Result<Vec<FileEntry>, TransferError> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let relative = resolve_within(root, path.as_ref())?;
            let meta = tokio::fs::metadata(root.join(&relative)).await?;
            entries.push(FileEntry::new(relative, meta.len()));
        }
        Ok(entries)
    }
}

/// A group of files archived and transferred as one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub files: Vec<FileEntry>,
    /// Cumulative size of `files` in bytes.
    pub size: u64,
}

impl Chunk {
    pub(crate) fn push(&mut self, file: FileEntry) {
        self.size += file.size;
        self.files.push(file);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
