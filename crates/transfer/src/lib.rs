//! Transfer planning helpers: chunk balancing, throttled progress reporting
//! and archive member path checks.

mod planner;
mod progress;
mod types;
mod validation;

pub use planner::plan;
pub use progress::{BulkProgress, ProgressAggregator, ProgressCallback};
pub use types::{Chunk, FileEntry};
pub use validation::{resolve_within, validate_member_path};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path escapes archive root: {0}")]
    OutsideRoot(String),
}
