use std::collections::HashMap;

/// Read access to the host's resolved dependency graph.
///
/// Nodes are addressed by their identity string (e.g. a locator hash).
pub trait DependencyGraph {
    /// Returns the identities of the resolved dependencies of `node`, or
    /// `None` if the node is not part of the graph.
    fn dependencies(&self, node: &str) -> Option<Vec<String>>;
}

impl<G: DependencyGraph + ?Sized> DependencyGraph for &G {
    fn dependencies(&self, node: &str) -> Option<Vec<String>> {
        (**self).dependencies(node)
    }
}

/// A node as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNode {
    pub identity: String,
    pub dependencies: Vec<String>,
}

impl PackageNode {
    pub fn new<I, S>(identity: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity: identity.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// Owned dependency graph built from the host's node iterator.
#[derive(Debug, Clone, Default)]
pub struct PackageGraph {
    nodes: HashMap<String, Vec<String>>,
}

impl PackageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node, replacing any previous entry with the same identity.
    pub fn insert(&mut self, node: PackageNode) {
        self.nodes.insert(node.identity, node.dependencies);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<PackageNode> for PackageGraph {
    fn from_iter<T: IntoIterator<Item = PackageNode>>(iter: T) -> Self {
        let mut graph = Self::new();
        for node in iter {
            graph.insert(node);
        }
        graph
    }
}

impl DependencyGraph for PackageGraph {
    fn dependencies(&self, node: &str) -> Option<Vec<String>> {
        self.nodes.get(node).cloned()
    }
}
