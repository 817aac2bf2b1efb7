use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ObjectPath;

// ---------------------------------------------------------------------------
// Ping
// ---------------------------------------------------------------------------

/// Liveness probe. Carries no fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingParams {}

/// Reply to a liveness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Fetches an object into a local path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    pub s3_path: ObjectPath,
    pub output_path: PathBuf,
    /// Expected SHA-512 (hex) of the stored file after decompression.
    /// Only checked for plain file downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub decompress: bool,
    #[serde(default)]
    pub untar: bool,
    /// Extract into `output_path` in place, keeping files already present,
    /// instead of replacing the directory.
    #[serde(default, skip_serializing_if = "is_false")]
    pub merge: bool,
}

/// Outcome of a download. `false` is a cache miss, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub downloaded: bool,
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

/// Streams a local file or directory into an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub s3_path: ObjectPath,
    pub input_path: PathBuf,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub create_tar: bool,
    /// Archive only these paths (relative to `input_path`) instead of the
    /// whole directory. Requires `create_tar`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// Replace an existing object. Without it an existing object is kept.
    #[serde(default, skip_serializing_if = "is_false")]
    pub overwrite: bool,
}

/// Outcome of an upload.
///
/// `uploaded` is `false` when the object already existed and was kept.
/// `size` is the stored object size when the backend reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_params_field_names() {
        let json = r#"{"s3Path":"s3://b/k.zip","outputPath":"/tmp/k.zip","checksum":"ff","decompress":true,"untar":false}"#;
        let params: DownloadParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.s3_path.bucket(), "b");
        assert_eq!(params.s3_path.key(), "k.zip");
        assert_eq!(params.checksum.as_deref(), Some("ff"));
        assert!(params.decompress);
        assert!(!params.merge);
    }

    #[test]
    fn download_params_flags_default_to_false() {
        let json = r#"{"s3Path":"s3://b/k","outputPath":"/tmp/k"}"#;
        let params: DownloadParams = serde_json::from_str(json).unwrap();
        assert!(params.checksum.is_none());
        assert!(!params.decompress);
        assert!(!params.untar);
    }

    #[test]
    fn upload_params_omit_defaults() {
        let params = UploadParams {
            s3_path: ObjectPath::new("b", "k.tar.gz"),
            input_path: "/build/out".into(),
            compress: true,
            create_tar: true,
            include: vec![],
            overwrite: false,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"createTar\":true"));
        assert!(!json.contains("include"));
        assert!(!json.contains("overwrite"));
    }

    #[test]
    fn upload_result_without_size() {
        let json = r#"{"uploaded":true}"#;
        let result: UploadResult = serde_json::from_str(json).unwrap();
        assert!(result.uploaded);
        assert!(result.size.is_none());
    }
}
