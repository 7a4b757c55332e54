//! Crawled link graph and damped authority scores
//!
//! A directed graph of canonical URLs built from harvested out-links.
//! Authority is a damped in-degree score computed PageRank-style with
//! power iteration: damping 0.85, 20 iterations, at most 100 out-links
//! counted per page to bound abuse.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// Damping factor (teleportation probability 1 − d)
pub const DAMPING: f64 = 0.85;
/// Power iterations
pub const ITERATIONS: usize = 20;
/// Out-links counted per page
pub const MAX_OUT_LINKS: usize = 100;

/// Directed link graph over canonical URLs
pub struct LinkGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    fn node(&mut self, url: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(url) {
            return *idx;
        }
        let idx = self.graph.add_node(url.to_string());
        self.nodes.insert(url.to_string(), idx);
        idx
    }

    /// Record a page and its out-links (capped at [`MAX_OUT_LINKS`]).
    /// Re-adding a page replaces its previous out-edges.
    pub fn record_page(&mut self, url: &str, out_links: &[String]) {
        let from = self.node(url);

        // Drop stale out-edges from a previous crawl of this page
        let old: Vec<_> = self
            .graph
            .edges_directed(from, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in old {
            self.graph.remove_edge(edge);
        }

        for link in out_links.iter().take(MAX_OUT_LINKS) {
            if link == url {
                continue; // self-links carry no authority
            }
            let to = self.node(link);
            self.graph.update_edge(from, to, ());
        }
    }

    pub fn page_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// In-degree of a URL (how many crawled pages point at it)
    pub fn in_degree(&self, url: &str) -> usize {
        self.nodes
            .get(url)
            .map(|idx| {
                self.graph
                    .edges_directed(*idx, Direction::Incoming)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Compute authority scores for every known URL, normalized to [0, 1]
    pub fn authority_scores(&self) -> HashMap<String, f64> {
        let n = self.graph.node_count();
        if n == 0 {
            return HashMap::new();
        }

        let mut rank = vec![1.0 / n as f64; n];
        let teleport = (1.0 - DAMPING) / n as f64;

        for _ in 0..ITERATIONS {
            let mut next = vec![teleport; n];
            // Mass lost to dangling nodes is spread evenly
            let mut dangling = 0.0;

            for node in self.graph.node_indices() {
                let out: Vec<NodeIndex> = self
                    .graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .collect();
                let share = rank[node.index()];
                if out.is_empty() {
                    dangling += share;
                    continue;
                }
                let per_edge = DAMPING * share / out.len() as f64;
                for target in out {
                    next[target.index()] += per_edge;
                }
            }

            let dangling_share = DAMPING * dangling / n as f64;
            for slot in next.iter_mut() {
                *slot += dangling_share;
            }
            rank = next;
        }

        // Normalize to [0, 1] by the max score
        let max = rank.iter().copied().fold(0.0, f64::max);
        let scale = if max > 0.0 { 1.0 / max } else { 0.0 };

        self.graph
            .node_indices()
            .map(|idx| (self.graph[idx].clone(), rank[idx.index()] * scale))
            .collect()
    }
}

impl Default for LinkGraph {
    fn default() -> Self {
        Self::new()
    }
}
