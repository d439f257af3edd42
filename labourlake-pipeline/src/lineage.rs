//! Lineage graph built from persisted transition logs.
//!
//! Nodes are `{layer}.{table}`; an edge runs from each source of a
//! transition to its target. The graph is derived on demand and never
//! persisted: the lineage log directory is the source of truth.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use petgraph::Direction;
use petgraph::algo::{astar, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::layer::Layer;
use crate::models::{TransitionLog, load_transition_logs, table_stem};

pub fn node_id(layer: Layer, table: &str) -> String {
    format!("{}.{table}", layer.as_str())
}

/// A table at one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageNode {
    pub node_id: String,
    pub layer: Layer,
    pub table_name: String,
    /// Row count from the latest transition touching this node.
    pub row_count: u64,
    /// Transforms that produced this node; empty for source-only nodes.
    pub transforms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub transition_id: Uuid,
    pub transforms: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Serialisable edge for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedEdge {
    pub from: String,
    pub to: String,
    #[serde(flatten)]
    pub edge: LineageEdge,
}

/// Whole-graph snapshot, nodes and edges sorted by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageExport {
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<ExportedEdge>,
}

type DedupKey = (Layer, Layer, String);

/// Keep only the latest log per `(source_layer, target_layer, target_table)`.
///
/// Failed transitions never contribute lineage. The result is ordered by
/// `started_at`.
pub fn deduplicate_logs(logs: Vec<TransitionLog>) -> Vec<TransitionLog> {
    let mut latest: HashMap<DedupKey, TransitionLog> = HashMap::new();
    for log in logs.into_iter().filter(|l| !l.is_failed()) {
        let key = (log.source_layer, log.target_layer, log.target_table());
        match latest.get(&key) {
            Some(kept) if (kept.started_at, kept.transition_id) >= (log.started_at, log.transition_id) => {}
            _ => {
                latest.insert(key, log);
            }
        }
    }
    let mut kept: Vec<TransitionLog> = latest.into_values().collect();
    kept.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.transition_id.cmp(&b.transition_id))
    });
    kept
}

/// Directed lineage graph over `{layer}.{table}` nodes.
#[derive(Debug, Clone)]
pub struct LineageGraph {
    lineage_dir: Option<PathBuf>,
    graph: DiGraph<LineageNode, LineageEdge>,
    index: HashMap<String, NodeIndex>,
}

impl LineageGraph {
    /// Load every log in `lineage_dir` and build the graph.
    pub fn build(lineage_dir: &Path) -> Result<Self> {
        let logs = load_transition_logs(lineage_dir)?;
        let mut graph = Self::from_logs(logs);
        graph.lineage_dir = Some(lineage_dir.to_path_buf());
        Ok(graph)
    }

    /// Build from logs already in memory.
    pub fn from_logs(logs: Vec<TransitionLog>) -> Self {
        let mut lineage = Self {
            lineage_dir: None,
            graph: DiGraph::new(),
            index: HashMap::new(),
        };
        let total = logs.len();
        let kept = deduplicate_logs(logs);
        for log in &kept {
            lineage.add_transition(log);
        }
        tracing::debug!(
            logs = total,
            kept = kept.len(),
            nodes = lineage.graph.node_count(),
            edges = lineage.graph.edge_count(),
            "Built lineage graph"
        );
        lineage
    }

    /// Reload from the directory this graph was built from.
    pub fn rebuild(&mut self) -> Result<()> {
        if let Some(dir) = self.lineage_dir.clone() {
            *self = Self::build(&dir)?;
        }
        Ok(())
    }

    fn ensure_node(&mut self, layer: Layer, table: &str, row_count: u64) -> NodeIndex {
        let id = node_id(layer, table);
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(LineageNode {
            node_id: id.clone(),
            layer,
            table_name: table.to_string(),
            row_count,
            transforms: Vec::new(),
        });
        self.index.insert(id, idx);
        idx
    }

    fn add_transition(&mut self, log: &TransitionLog) {
        let target_table = log.target_table();
        let target = self.ensure_node(log.target_layer, &target_table, log.row_count_out);
        let node = &mut self.graph[target];
        node.row_count = log.row_count_out;
        node.transforms = log.transforms_applied.clone();

        for source_file in &log.source_files {
            let source = self.ensure_node(log.source_layer, &table_stem(source_file), log.row_count_in);
            self.graph.update_edge(
                source,
                target,
                LineageEdge {
                    transition_id: log.transition_id,
                    transforms: log.transforms_applied.clone(),
                    timestamp: log.started_at,
                },
            );
        }
    }

    fn reachable(&self, start: &str, direction: Direction) -> Vec<String> {
        let Some(&start) = self.index.get(start) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        let mut result = Vec::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if node != start {
                result.push(self.graph[node].node_id.clone());
            }
            stack.extend(self.graph.neighbors_directed(node, direction));
        }
        result.sort();
        result
    }

    /// Sorted ancestors of `{layer}.{table}`; empty if the node is unknown.
    pub fn get_upstream(&self, table: &str, layer: Layer) -> Vec<String> {
        self.reachable(&node_id(layer, table), Direction::Incoming)
    }

    /// Sorted descendants of `{layer}.{table}`; empty if the node is unknown.
    pub fn get_downstream(&self, table: &str, layer: Layer) -> Vec<String> {
        self.reachable(&node_id(layer, table), Direction::Outgoing)
    }

    /// Shortest path between any layer variant of `source_table` and any
    /// layer variant of `target_table`.
    ///
    /// Sources are tried from the earliest layer, targets from the latest,
    /// so the first path found spans the most lineage. Empty when no path
    /// exists.
    pub fn get_path(&self, source_table: &str, target_table: &str) -> Vec<String> {
        for source_layer in Layer::ALL {
            let Some(&from) = self.index.get(&node_id(source_layer, source_table)) else {
                continue;
            };
            for target_layer in Layer::ALL.into_iter().rev() {
                let Some(&to) = self.index.get(&node_id(target_layer, target_table)) else {
                    continue;
                };
                if from == to {
                    continue;
                }
                if let Some((_, path)) = astar(&self.graph, from, |n| n == to, |_| 1u32, |_| 0) {
                    return path.into_iter().map(|n| self.graph[n].node_id.clone()).collect();
                }
            }
        }
        Vec::new()
    }

    pub fn get_node_metadata(&self, node_id: &str) -> Option<&LineageNode> {
        self.index.get(node_id).map(|&idx| &self.graph[idx])
    }

    pub fn get_edge(&self, from: &str, to: &str) -> Option<&LineageEdge> {
        let (&a, &b) = (self.index.get(from)?, self.index.get(to)?);
        self.graph.find_edge(a, b).map(|e| &self.graph[e])
    }

    /// True when the graph has no cycles.
    pub fn is_valid_dag(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes sorted by id.
    pub fn nodes(&self) -> Vec<&LineageNode> {
        let mut nodes: Vec<&LineageNode> = self.graph.node_weights().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn export(&self) -> LineageExport {
        let nodes = self.nodes().into_iter().cloned().collect();
        let mut edges: Vec<ExportedEdge> = self
            .graph
            .edge_references()
            .map(|e| ExportedEdge {
                from: self.graph[e.source()].node_id.clone(),
                to: self.graph[e.target()].node_id.clone(),
                edge: e.weight().clone(),
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        LineageExport { nodes, edges }
    }
}
