use flowx_dag::{Pipeline, ENTRY_NODE, EXIT_NODE};
use flowx_types::{FlowError, Namespaces, Result};

use crate::reference::parse_reference;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Directed edges in insertion order, with duplicate pairs suppressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSet {
    edges: Vec<FlowEdge>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `source -> target` unless the pair is already present.
    pub fn insert(&mut self, source: &str, target: &str) -> bool {
        if self.contains(source, target) {
            return false;
        }
        self.edges.push(FlowEdge::new(source, target));
        true
    }

    pub fn contains(&self, source: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source == source && e.target == target)
    }

    /// `true` when any edge ends at `target`.
    pub fn has_incoming(&self, target: &str) -> bool {
        self.edges.iter().any(|e| e.target == target)
    }

    /// Targets of the edges leaving `source`, in insertion order.
    pub fn successors<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.source == source)
            .map(|e| e.target.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEdge> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Derive the dependency edges of a pipeline.
///
/// Every `${ns.field}` reference in a node's reference-bearing fields adds
/// `ns -> node`, except self-references and references into a context
/// namespace. The node named by the exit reference feeds the exit, and the
/// entry feeds every node that has no other incoming edge.
pub fn build_edges(pipeline: &Pipeline, namespaces: &Namespaces) -> Result<EdgeSet> {
    let mut edges = EdgeSet::new();

    for node in &pipeline.nodes {
        for raw in node.reference_bearing() {
            let Some(reference) = parse_reference(raw) else {
                continue;
            };
            if reference.namespace == node.name || namespaces.contains(reference.namespace) {
                continue;
            }
            edges.insert(reference.namespace, &node.name);
        }
    }

    let exit_reference = pipeline
        .exit_reference
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| FlowError::config("outputs.reference not defined"))?;
    if let Some(reference) = parse_reference(exit_reference) {
        if pipeline.contains(reference.namespace) {
            edges.insert(reference.namespace, EXIT_NODE);
        }
    }

    for name in pipeline.node_names() {
        if !edges.has_incoming(name) {
            edges.insert(ENTRY_NODE, name);
        }
    }

    tracing::debug!(edges = edges.len(), "edges built");
    Ok(edges)
}
