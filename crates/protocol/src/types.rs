use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::{DEFAULT_MAX_DOWNLOAD_CONCURRENCY, DEFAULT_MAX_UPLOAD_CONCURRENCY};

const S3_SCHEME: &str = "s3://";

/// Location of an object: `s3://<bucket>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath {
    bucket: String,
    key: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parses `s3://bucket/key`. Both parts must be non-empty.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let rest = s
            .strip_prefix(S3_SCHEME)
            .ok_or_else(|| ProtocolError::InvalidObjectPath(s.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(ProtocolError::InvalidObjectPath(s.to_string())),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{S3_SCHEME}{}/{}", self.bucket, self.key)
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectPath> for String {
    fn from(value: ObjectPath) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Worker configuration
// ---------------------------------------------------------------------------

/// Where the worker gets storage credentials from.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CredentialsSource {
    /// The SDK's default provider chain (environment, profile, instance role).
    #[default]
    Default,
    /// A named profile from the shared config files.
    Profile { name: String },
    /// Explicit keys handed over by the control process.
    #[serde(rename_all = "camelCase")]
    Static {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
}

impl fmt::Debug for CredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsSource::Default => f.write_str("Default"),
            CredentialsSource::Profile { name } => {
                f.debug_struct("Profile").field("name", name).finish()
            }
            CredentialsSource::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"<redacted>")
                .finish_non_exhaustive(),
        }
    }
}

/// Object storage backend used by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StorageBackend {
    #[default]
    S3,
    /// Objects stored as files under `<root>/<bucket>/<key>`.
    Local { root: PathBuf },
}

/// Configuration blob handed to the worker process at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub socket_path: PathBuf,
    #[serde(default = "default_download_concurrency")]
    pub max_download_concurrency: usize,
    #[serde(default = "default_upload_concurrency")]
    pub max_upload_concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsSource,
    pub bucket: String,
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

fn default_download_concurrency() -> usize {
    DEFAULT_MAX_DOWNLOAD_CONCURRENCY
}

fn default_upload_concurrency() -> usize {
    DEFAULT_MAX_UPLOAD_CONCURRENCY
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// One archived chunk of a bulk cache generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub size: u64,
}

/// Describes one complete generation of a bulk cache upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub all_files: Vec<ManifestEntry>,
    pub uploaded: DateTime<Utc>,
}

impl Manifest {
    /// Sum of all entry sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.all_files.iter().map(|f| f.size).sum()
    }
}
