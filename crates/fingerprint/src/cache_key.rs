/// A package checksum split into its cache prefix and storage hash.
///
/// Checksums look like `[<version><variant>/]<hash>`, e.g. `10c0/3f2a...`. Only
/// [`CacheKey::hash`] addresses objects in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    cache_key: Option<String>,
    version: Option<u64>,
    variant: Option<String>,
    hash: String,
}

impl CacheKey {
    /// Parses a checksum. Never fails: without a recognizable prefix the
    /// whole string is the hash.
    pub fn parse(checksum: &str) -> Self {
        if let Some((prefix, hash)) = checksum.rsplit_once('/') {
            let digits = prefix
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(prefix.len());
            if digits > 0 {
                return Self {
                    cache_key: Some(prefix.to_string()),
                    version: prefix[..digits].parse().ok(),
                    variant: Some(prefix[digits..].to_string()),
                    hash: hash.to_string(),
                };
            }
        }

        Self {
            cache_key: None,
            version: None,
            variant: None,
            hash: checksum.to_string(),
        }
    }

    /// The full `<version><variant>` prefix, if present.
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    /// Numeric cache version. `None` when absent or out of range.
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_prefix() {
        let key = CacheKey::parse("10c0/abcdef");
        assert_eq!(key.cache_key(), Some("10c0"));
        assert_eq!(key.version(), Some(10));
        assert_eq!(key.variant(), Some("c0"));
        assert_eq!(key.hash(), "abcdef");
    }

    #[test]
    fn without_prefix() {
        let key = CacheKey::parse("abcdef");
        assert_eq!(key.cache_key(), None);
        assert_eq!(key.version(), None);
        assert_eq!(key.variant(), None);
        assert_eq!(key.hash(), "abcdef");
    }

    #[test]
    fn non_numeric_prefix_is_part_of_the_hash() {
        let key = CacheKey::parse("sha512/abcdef");
        assert_eq!(key.cache_key(), None);
        assert_eq!(key.hash(), "sha512/abcdef");
    }

    #[test]
    fn splits_at_last_slash() {
        let key = CacheKey::parse("9/a/b/cafe");
        assert_eq!(key.cache_key(), Some("9/a/b"));
        assert_eq!(key.version(), Some(9));
        assert_eq!(key.variant(), Some("/a/b"));
        assert_eq!(key.hash(), "cafe");
    }

    #[test]
    fn bare_version_and_empty_hash() {
        let key = CacheKey::parse("8/");
        assert_eq!(key.version(), Some(8));
        assert_eq!(key.variant(), Some(""));
        assert_eq!(key.hash(), "");
    }
}
