use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates that an archive member path stays inside its extraction root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_member_path(path: &Path) -> Result<(), TransferError> {
    if path.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let shown = path.display();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {shown}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {shown}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {shown}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Maps `path` (absolute, or relative to `root`) to its path relative to
/// `root`, failing if it lies outside.
///
/// Purely lexical: symlinks are not resolved.
pub fn resolve_within(root: &Path, path: &Path) -> Result<PathBuf, TransferError> {
    let relative = if path.is_absolute() {
        path.strip_prefix(root)
            .map_err(|_| TransferError::OutsideRoot(path.display().to_string()))?
            .to_path_buf()
    } else {
        path.to_path_buf()
    };

    let normalized: PathBuf = relative
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    match validate_member_path(&normalized) {
        Ok(()) => Ok(normalized),
        Err(_) => Err(TransferError::OutsideRoot(path.display().to_string())),
    }
}
