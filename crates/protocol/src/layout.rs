//! Object-storage key layout.
//!
//! ```text
//! <bucket>/<hash>.zip                                   package archive
//! <bucket>/<hash>.zip.gz                                package archive, gzipped
//! <bucket>/<buildHash>.tar.gz                           build output
//! <bucket>/metadata/<cacheKey>                          bulk manifest
//! <bucket>/archives/<cacheKey>/<generation>/<i>.tar     bulk chunk
//! ```

use chrono::{DateTime, Utc};

/// Key prefix for bulk manifests.
pub const METADATA_PREFIX: &str = "metadata";

/// Key prefix for bulk chunk archives.
pub const ARCHIVES_PREFIX: &str = "archives";

/// Key of a single package archive.
pub fn package_key(hash: &str, compressed: bool) -> String {
    if compressed {
        format!("{hash}.zip.gz")
    } else {
        format!("{hash}.zip")
    }
}

/// Key of a build output archive.
pub fn build_key(build_hash: &str) -> String {
    format!("{build_hash}.tar.gz")
}

/// Key of the manifest for `cache_key`.
pub fn metadata_key(cache_key: &str) -> String {
    format!("{METADATA_PREFIX}/{cache_key}")
}

/// Generation label: the upload timestamp plus a caller-chosen `nonce`, so
/// two uploads in the same millisecond still get distinct chunk keys.
pub fn generation_label(uploaded: &DateTime<Utc>, nonce: &str) -> String {
    format!("{}-{nonce}", uploaded.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Key of chunk `index` within a bulk generation.
pub fn archive_key(cache_key: &str, generation: &str, index: usize) -> String {
    format!("{ARCHIVES_PREFIX}/{cache_key}/{generation}/{index}.tar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn package_keys() {
        assert_eq!(package_key("abc", false), "abc.zip");
        assert_eq!(package_key("abc", true), "abc.zip.gz");
    }

    #[test]
    fn build_and_metadata_keys() {
        assert_eq!(build_key("f00d"), "f00d.tar.gz");
        assert_eq!(metadata_key("my-app-0"), "metadata/my-app-0");
    }

    #[test]
    fn archive_keys_are_unique_per_generation() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let generation = generation_label(&t, "9f2c41ab");
        assert_eq!(generation, "20240301T123005.000Z-9f2c41ab");
        assert_eq!(
            archive_key("my-app-0", &generation, 3),
            "archives/my-app-0/20240301T123005.000Z-9f2c41ab/3.tar"
        );
        assert_ne!(generation_label(&t, "00000000"), generation);
    }
}
