//! Step graph for workflow execution.
//!
//! StepGraph represents the successor relation between named workflow
//! steps as a directed acyclic graph. A chain is a DAG where every step has
//! at most one successor.

use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The step dependency graph.
///
/// Nodes are step names; an edge `a -> b` means `b` runs after `a`.
#[derive(Clone)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    /// Index mapping from step name to NodeIndex for fast lookups.
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a step. Adding an existing name returns its NodeIndex.
    pub fn add_step(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }

    /// Declare that `to` runs after `from`.
    ///
    /// # Errors
    /// Returns `Error::Config` if either step is unknown or the edge would
    /// close a cycle. The graph is left unchanged on error.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        let from_index = *self
            .index
            .get(from)
            .ok_or_else(|| Error::Config(format!("step {} not found in workflow", from)))?;
        let to_index = *self.index.get(to).ok_or_else(|| {
            Error::Config(format!("step {} references unknown successor {}", from, to))
        })?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Config(format!(
                "successor {} -> {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        names.sort();
        names
    }

    /// Steps that must finish before `name`, sorted by name.
    pub fn predecessors(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Steps that run after `name`, sorted by name.
    pub fn successors(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Steps with no predecessors.
    pub fn roots(&self) -> Vec<String> {
        self.filter_nodes(Direction::Incoming)
    }

    /// Steps with an empty successor set.
    pub fn terminal_steps(&self) -> Vec<String> {
        self.filter_nodes(Direction::Outgoing)
    }

    fn filter_nodes(&self, direction: Direction) -> Vec<String> {
        let mut names: Vec<String> = self
            .graph
            .node_indices()
            .filter(|&i| self.graph.neighbors_directed(i, direction).next().is_none())
            .filter_map(|i| self.graph.node_weight(i).cloned())
            .collect();
        names.sort();
        names
    }

    // ========== Scheduling Operations ==========

    /// Steps whose predecessors are all in `finished` and which are not
    /// finished themselves, in topological order.
    pub fn ready_steps(&self, finished: &HashSet<String>) -> Result<Vec<String>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|name| !finished.contains(name))
            .filter(|name| {
                self.predecessors(name)
                    .iter()
                    .all(|pred| finished.contains(pred))
            })
            .collect())
    }

    pub fn all_finished(&self, finished: &HashSet<String>) -> bool {
        self.index.keys().all(|name| finished.contains(name))
    }

    /// Step names in an order where each step follows all its predecessors.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(String::as_str)
                .unwrap_or("unknown");
            Error::Config(format!("cycle detected at step: {}", name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index).cloned())
            .collect())
    }
}

impl Default for StepGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("steps", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
