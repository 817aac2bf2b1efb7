//! Fingerprint engine.
//!
//! Turns a node of the host's dependency graph into a stable SHA-512 digest
//! identifying "this subtree, built on this machine class, at this location".
//! Digests are hex encoded and memoized per node for the lifetime of one
//! [`Fingerprinter`].

mod cache_key;
mod graph;
mod hasher;

pub use cache_key::CacheKey;
pub use graph::{DependencyGraph, PackageGraph, PackageNode};
pub use hasher::{Fingerprinter, GlobalHash, GlobalHashBuilder, PlatformTriple, RECURSIVE_SENTINEL};

use sha2::{Digest, Sha512};

/// Errors produced while fingerprinting.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("package not registered in the dependency graph: {0}")]
    UnknownNode(String),
}

/// Computes SHA-512 of `data` and returns the hex-encoded digest.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha512_hex_length() {
        let digest = sha512_hex(b"hello world");
        assert_eq!(digest.len(), 128);
        assert_eq!(digest, sha512_hex(b"hello world"));
        assert_ne!(digest, sha512_hex(b"hello"));
    }
}
