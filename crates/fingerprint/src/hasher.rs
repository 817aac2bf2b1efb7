use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha512};

use crate::FingerprintError;
use crate::graph::DependencyGraph;

/// Memo value recorded for a node while its dependencies are being hashed.
///
/// A dependency cycle resolves to this constant instead of recursing forever.
pub const RECURSIVE_SENTINEL: &str = "<recursive>";

/// The machine class a build output is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformTriple(String);

impl PlatformTriple {
    pub fn new(triple: impl Into<String>) -> Self {
        Self(triple.into())
    }

    /// `<arch>-<os>-<family>` of the running binary, e.g. `x86_64-linux-unix`.
    pub fn current() -> Self {
        use std::env::consts::{ARCH, FAMILY, OS};
        Self(format!("{ARCH}-{OS}-{FAMILY}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of everything that is not specific to a single package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHash(String);

impl GlobalHash {
    /// Starts a global hash for `platform`.
    pub fn builder(platform: &PlatformTriple) -> GlobalHashBuilder {
        let mut hasher = Sha512::new();
        hasher.update(platform.as_str().as_bytes());
        GlobalHashBuilder { hasher }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Accumulates extra bytes injected by collaborators into the global hash.
///
/// Order of registration is significant.
pub struct GlobalHashBuilder {
    hasher: Sha512,
}

impl GlobalHashBuilder {
    /// Appends a blob of extra bytes.
    pub fn extra(mut self, data: impl AsRef<[u8]>) -> Self {
        self.register(data);
        self
    }

    /// Appends a blob of extra bytes in place (collaborator callback form).
    pub fn register(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(b"\0");
        self.hasher.update(data.as_ref());
    }

    pub fn build(self) -> GlobalHash {
        GlobalHash(hex::encode(self.hasher.finalize()))
    }
}

/// Computes base and build hashes over a dependency graph.
///
/// Base hashes are memoized by node identity for the lifetime of the value;
/// create one per run.
pub struct Fingerprinter<G: DependencyGraph> {
    graph: G,
    global: GlobalHash,
    memo: HashMap<String, String>,
}

impl<G: DependencyGraph> Fingerprinter<G> {
    /// `graph` may be owned or borrowed; `&G` is a graph too.
    pub fn new(graph: G, global: GlobalHash) -> Self {
        Self {
            graph,
            global,
            memo: HashMap::new(),
        }
    }

    pub fn global(&self) -> &GlobalHash {
        &self.global
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// `H(identity ++ "\0" ++ sorted(base_hash(dep) for each resolved dependency))`.
    pub fn base_hash(&mut self, node: &str) -> Result<String, FingerprintError> {
        if let Some(hash) = self.memo.get(node) {
            return Ok(hash.clone());
        }

        let dependencies = self
            .graph
            .dependencies(node)
            .ok_or_else(|| FingerprintError::UnknownNode(node.to_string()))?;

        self.memo
            .insert(node.to_string(), RECURSIVE_SENTINEL.to_string());

        let mut dep_hashes = Vec::with_capacity(dependencies.len());
        for dep in &dependencies {
            match self.base_hash(dep) {
                Ok(hash) => dep_hashes.push(hash),
                Err(e) => {
                    self.memo.remove(node);
                    return Err(e);
                }
            }
        }
        dep_hashes.sort_unstable();

        let mut hasher = Sha512::new();
        hasher.update(node.as_bytes());
        hasher.update(b"\0");
        for hash in &dep_hashes {
            hasher.update(hash.as_bytes());
        }
        let hash = hex::encode(hasher.finalize());

        tracing::trace!(node, dependencies = dep_hashes.len(), "base hash computed");
        self.memo.insert(node.to_string(), hash.clone());
        Ok(hash)
    }

    /// `H(global ++ base_hash(node) ++ each(location))`.
    ///
    /// Locations are hashed in the order given.
    pub fn build_hash<P: AsRef<Path>>(
        &mut self,
        node: &str,
        locations: &[P],
    ) -> Result<String, FingerprintError> {
        let base = self.base_hash(node)?;

        let mut hasher = Sha512::new();
        hasher.update(self.global.as_str().as_bytes());
        hasher.update(base.as_bytes());
        for location in locations {
            hasher.update(location.as_ref().as_os_str().as_encoded_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
