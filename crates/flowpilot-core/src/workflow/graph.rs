//! Graph indexing, deterministic ordering, and cycle diagnostics.
//!
//! `WorkflowGraph` turns the node and edge lists into adjacency indices the
//! scheduler consults every pass. `topological_order` is Kahn's algorithm with
//! a FIFO queue; nodes it cannot reach (cycles) are appended in their original
//! list order, so the result is always a total order over every node.

use std::collections::{HashMap, HashSet, VecDeque};

use flowpilot_types::workflow::{Edge, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Adjacency indices over a definition.
///
/// Every node id in the node list has an entry in all four maps, even with no
/// edges. Edges that name unknown node ids are still indexed under those ids.
#[derive(Debug, Default)]
pub struct WorkflowGraph<'a> {
    pub predecessors: HashMap<&'a str, Vec<&'a str>>,
    pub successors: HashMap<&'a str, Vec<&'a str>>,
    pub incoming_edges: HashMap<&'a str, Vec<&'a Edge>>,
    pub outgoing_edges: HashMap<&'a str, Vec<&'a Edge>>,
}

impl<'a> WorkflowGraph<'a> {
    pub fn build(definition: &'a WorkflowDefinition) -> Self {
        let mut graph = Self::default();

        for node in &definition.nodes {
            let id = node.id.as_str();
            graph.predecessors.entry(id).or_default();
            graph.successors.entry(id).or_default();
            graph.incoming_edges.entry(id).or_default();
            graph.outgoing_edges.entry(id).or_default();
        }

        for edge in &definition.edges {
            let (source, target) = (edge.source.as_str(), edge.target.as_str());
            graph.predecessors.entry(target).or_default().push(source);
            graph.successors.entry(source).or_default().push(target);
            graph.incoming_edges.entry(target).or_default().push(edge);
            graph.outgoing_edges.entry(source).or_default().push(edge);
        }

        graph
    }

    pub fn predecessors_of(&self, id: &str) -> &[&'a str] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors_of(&self, id: &str) -> &[&'a str] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_edges_of(&self, id: &str) -> &[&'a Edge] {
        self.incoming_edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing_edges_of(&self, id: &str) -> &[&'a Edge] {
        self.outgoing_edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// Deterministic visitation order over every node in the definition.
pub fn topological_order(definition: &WorkflowDefinition) -> Vec<&str> {
    let known: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = known.iter().map(|id| (*id, 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        let (source, target) = (edge.source.as_str(), edge.target.as_str());
        if !known.contains(target) {
            continue;
        }
        // An unknown source still counts: its target never reaches zero
        // in-degree and is appended after the Kahn pass.
        *in_degree.entry(target).or_default() += 1;
        if known.contains(source) {
            outgoing.entry(source).or_default().push(target);
        }
    }

    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();

    let mut order = Vec::with_capacity(definition.nodes.len());
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        for &next in outgoing.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    // Anything left sits on or behind a cycle.
    for node in &definition.nodes {
        if visited.insert(node.id.as_str()) {
            order.push(node.id.as_str());
        }
    }

    order
}

// ---------------------------------------------------------------------------
// Cycle diagnostics
// ---------------------------------------------------------------------------

/// Returns the id of a node on a cycle, if the known-node subgraph has one.
pub fn find_cycle(definition: &WorkflowDefinition) -> Option<String> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for node in &definition.nodes {
        indices
            .entry(node.id.as_str())
            .or_insert_with(|| graph.add_node(node.id.as_str()));
    }

    for edge in &definition.edges {
        if let (Some(from), Some(to)) = (
            indices.get(edge.source.as_str()),
            indices.get(edge.target.as_str()),
        ) {
            graph.add_edge(*from, *to, ());
        }
    }

    toposort(&graph, None)
        .err()
        .map(|cycle| graph[cycle.node_id()].to_string())
}
