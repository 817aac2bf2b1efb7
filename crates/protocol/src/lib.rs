//! Wire protocol for the bucketcache control process and transfer worker.
//!
//! The coordinator talks to the worker over a Unix domain socket using
//! newline-delimited JSON-RPC 2.0. This crate holds the envelope, the
//! per-method payloads, the worker configuration blob and the object-storage
//! layout both sides agree on.

pub mod constants;
pub mod envelope;
pub mod layout;
pub mod messages;
pub mod types;

pub use constants::Method;
pub use envelope::{RpcError, RpcRequest, RpcResponse};
pub use types::{CredentialsSource, Manifest, ManifestEntry, ObjectPath, StorageBackend, WorkerConfig};

/// Errors produced while parsing protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid object path: {0}")]
    InvalidObjectPath(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
