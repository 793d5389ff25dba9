//! Serializable dependency graph keyed by unit identifier.
//!
//! Two adjacency maps (forward and reverse) plus a node table. The
//! reverse map is always derivable from the forward map; it is kept
//! materialized so `dependents_of` is a single lookup, and rebuilt on
//! load so serialized graphs stay canonical.
//!
//! PageRank runs over a petgraph projection of the adjacency.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::types::{DependencyVia, ExtractedUnit, UnitType};

/// PageRank damping factor.
const PAGERANK_DAMPING: f64 = 0.85;
/// Maximum PageRank power iterations.
const PAGERANK_MAX_ITER: usize = 30;
/// L1 fixed-point tolerance that ends iteration early.
const PAGERANK_EPSILON: f64 = 1e-6;

/// A directed edge between two units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Identifier of the depending unit.
    pub source: String,
    /// Identifier of the unit depended on.
    pub target: String,
    /// Free-form relationship label.
    #[serde(rename = "type")]
    pub dep_type: String,
    /// How the edge was discovered.
    pub via: DependencyVia,
}

/// Node attributes kept alongside the adjacency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Unit kind.
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    /// Repository-relative source path.
    pub file_path: String,
}

/// Forward + reverse adjacency keyed by identifier, with a node table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Outgoing edges per identifier.
    pub forward: BTreeMap<String, Vec<GraphEdge>>,
    /// Incoming edges per identifier (derived; rebuilt on load).
    pub reverse: BTreeMap<String, Vec<GraphEdge>>,
    /// Node attributes per identifier.
    pub nodes: BTreeMap<String, GraphNode>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit: node attributes plus its outgoing edges in both
    /// adjacency directions. Re-registering replaces the unit's edges.
    pub fn register(&mut self, unit: &ExtractedUnit) {
        self.unregister(&unit.identifier);

        self.nodes.insert(
            unit.identifier.clone(),
            GraphNode {
                unit_type: unit.unit_type,
                file_path: unit.file_path.clone(),
            },
        );

        for dep in &unit.dependencies {
            let edge = GraphEdge {
                source: unit.identifier.clone(),
                target: dep.target.clone(),
                dep_type: dep.dep_type.clone(),
                via: dep.via,
            };
            self.reverse.entry(edge.target.clone()).or_default().push(edge.clone());
            self.forward.entry(edge.source.clone()).or_default().push(edge);
        }
    }

    /// Remove a unit's node and every edge that touches it as a source.
    /// Returns whether the node existed.
    pub fn unregister(&mut self, id: &str) -> bool {
        let existed = self.nodes.remove(id).is_some();

        if let Some(edges) = self.forward.remove(id) {
            for edge in edges {
                let emptied = match self.reverse.get_mut(&edge.target) {
                    Some(rev) => {
                        rev.retain(|e| e.source != id);
                        rev.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.reverse.remove(&edge.target);
                }
            }
        }

        existed
    }

    /// Outgoing edges from a unit.
    pub fn dependencies_of(&self, id: &str) -> Vec<GraphEdge> {
        self.forward.get(id).cloned().unwrap_or_default()
    }

    /// Incoming edges to a unit.
    pub fn dependents_of(&self, id: &str) -> Vec<GraphEdge> {
        self.reverse.get(id).cloned().unwrap_or_default()
    }

    /// Identifiers of all registered units of one type.
    pub fn by_type(&self, unit_type: UnitType) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.unit_type == unit_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Units located in the given paths, plus their direct dependents.
    pub fn affected_by(&self, paths: &[String]) -> Vec<String> {
        let path_set: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
        let mut affected = BTreeSet::new();

        for (id, node) in &self.nodes {
            if path_set.contains(node.file_path.as_str()) {
                affected.insert(id.clone());
                for edge in self.dependents_of(id) {
                    affected.insert(edge.source);
                }
            }
        }

        affected.into_iter().collect()
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of forward edges.
    pub fn edge_count(&self) -> usize {
        self.forward.values().map(Vec::len).sum()
    }

    /// PageRank scores per identifier.
    ///
    /// Damping 0.85; stops at 30 iterations or when the L1 delta drops
    /// below 1e-6, whichever comes first. Edges to unregistered targets
    /// still contribute nodes so scores cover every mentioned identifier.
    pub fn pagerank(&self) -> BTreeMap<String, f64> {
        let mut ids: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for edges in self.forward.values() {
            for edge in edges {
                ids.insert(edge.source.as_str());
                ids.insert(edge.target.as_str());
            }
        }
        let id_list: Vec<&str> = ids.into_iter().collect();
        let index: BTreeMap<&str, usize> =
            id_list.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let mut graph: DiGraph<(), ()> = DiGraph::new();
        let node_indices: Vec<NodeIndex> = id_list.iter().map(|_| graph.add_node(())).collect();
        for edges in self.forward.values() {
            for edge in edges {
                graph.add_edge(
                    node_indices[index[edge.source.as_str()]],
                    node_indices[index[edge.target.as_str()]],
                    (),
                );
            }
        }

        let n = graph.node_count();
        if n == 0 {
            return BTreeMap::new();
        }

        let base = (1.0 - PAGERANK_DAMPING) / n as f64;
        let mut ranks = vec![1.0 / n as f64; n];

        for _ in 0..PAGERANK_MAX_ITER {
            let mut next = vec![base; n];
            let mut dangling = 0.0;

            for node in graph.node_indices() {
                let out_degree = graph
                    .neighbors_directed(node, petgraph::Direction::Outgoing)
                    .count();
                let rank = ranks[node.index()];
                if out_degree == 0 {
                    dangling += rank;
                    continue;
                }
                let share = PAGERANK_DAMPING * rank / out_degree as f64;
                for neighbor in graph.neighbors_directed(node, petgraph::Direction::Outgoing) {
                    next[neighbor.index()] += share;
                }
            }

            // Dangling mass is redistributed uniformly.
            let dangling_share = PAGERANK_DAMPING * dangling / n as f64;
            for value in &mut next {
                *value += dangling_share;
            }

            let delta: f64 = ranks
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            ranks = next;
            if delta < PAGERANK_EPSILON {
                break;
            }
        }

        id_list
            .iter()
            .map(|&id| (id.to_string(), ranks[index[id]]))
            .collect()
    }

    /// Serialize to a JSON value with identifier keys as strings.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "forward": self.forward,
            "reverse": self.reverse,
            "nodes": self.nodes,
        })
    }

    /// Deserialize from a JSON value, rebuilding the reverse adjacency
    /// from the forward map so loaded graphs stay canonical.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            forward: BTreeMap<String, Vec<GraphEdge>>,
            #[serde(default)]
            nodes: BTreeMap<String, GraphNode>,
        }

        let raw: Raw = serde_json::from_value(value.clone())?;
        let mut reverse: BTreeMap<String, Vec<GraphEdge>> = BTreeMap::new();
        for edges in raw.forward.values() {
            for edge in edges {
                reverse.entry(edge.target.clone()).or_default().push(edge.clone());
            }
        }

        Ok(Self { forward: raw.forward, reverse, nodes: raw.nodes })
    }
}
