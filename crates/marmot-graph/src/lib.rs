//! In-memory lineage index over the relational `asset_lineage` table.
//!
//! The relational table in `marmot-store` is the durable source of truth;
//! `LineageGraph` is a derived index rebuilt from it, used to answer
//! "upstream of" / "downstream of" / cycle-detection queries without
//! round-tripping to the database for every edge.

mod error;

use std::collections::{HashMap, HashSet};

use marmot_domain::{LineageEdge, Mrn};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

pub use error::GraphError;

pub struct LineageGraph {
    graph: DiGraph<Mrn, ()>,
    index: HashMap<Mrn, NodeIndex>,
}

impl LineageGraph {
    /// Rebuild the index from the full set of lineage edges. Nodes are
    /// created implicitly from the edges' endpoints — an asset with no
    /// lineage simply has no node and an empty upstream/downstream set.
    pub fn build(edges: &[LineageEdge]) -> Result<Self, GraphError> {
        let mut graph: DiGraph<Mrn, ()> = DiGraph::new();
        let mut index: HashMap<Mrn, NodeIndex> = HashMap::new();

        let mut node_for = |graph: &mut DiGraph<Mrn, ()>, index: &mut HashMap<Mrn, NodeIndex>, mrn: &Mrn| -> NodeIndex {
            if let Some(idx) = index.get(mrn) {
                return *idx;
            }
            let idx = graph.add_node(mrn.clone());
            index.insert(mrn.clone(), idx);
            idx
        };

        for edge in edges {
            let from = node_for(&mut graph, &mut index, &edge.source_mrn);
            let to = node_for(&mut graph, &mut index, &edge.target_mrn);
            graph.add_edge(from, to, ());
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            let offender = edges.first().map(|e| e.source_mrn.clone()).unwrap_or_else(|| Mrn::new(""));
            return Err(GraphError::CycleDetected(offender));
        }

        Ok(LineageGraph { graph, index })
    }

    /// Direct (one-hop) upstream sources of `mrn`.
    pub fn upstream(&self, mrn: &Mrn) -> Vec<Mrn> {
        self.neighbors(mrn, Direction::Incoming)
    }

    /// Direct (one-hop) downstream consumers of `mrn`.
    pub fn downstream(&self, mrn: &Mrn) -> Vec<Mrn> {
        self.neighbors(mrn, Direction::Outgoing)
    }

    /// All transitive ancestors of `mrn` (every asset reachable by walking
    /// upstream edges), excluding `mrn` itself.
    pub fn all_upstream(&self, mrn: &Mrn) -> Vec<Mrn> {
        self.transitive(mrn, Direction::Incoming)
    }

    /// All transitive descendants of `mrn`, excluding `mrn` itself.
    pub fn all_downstream(&self, mrn: &Mrn) -> Vec<Mrn> {
        self.transitive(mrn, Direction::Outgoing)
    }

    fn neighbors(&self, mrn: &Mrn, dir: Direction) -> Vec<Mrn> {
        let Some(&idx) = self.index.get(mrn) else { return Vec::new() };
        self.graph
            .edges_directed(idx, dir)
            .map(|e| {
                let other = if dir == Direction::Incoming { e.source() } else { e.target() };
                self.graph[other].clone()
            })
            .collect()
    }

    fn transitive(&self, mrn: &Mrn, dir: Direction) -> Vec<Mrn> {
        let Some(&start) = self.index.get(mrn) else { return Vec::new() };
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = vec![start];
        let mut out = Vec::new();

        while let Some(idx) = stack.pop() {
            for e in self.graph.edges_directed(idx, dir) {
                let other = if dir == Direction::Incoming { e.source() } else { e.target() };
                if seen.insert(other) {
                    out.push(self.graph[other].clone());
                    stack.push(other);
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::LineageType;

    fn edge(source: &str, target: &str) -> LineageEdge {
        LineageEdge { source_mrn: Mrn::new(source), target_mrn: Mrn::new(target), edge_type: LineageType::DataFlow }
    }

    #[test]
    fn direct_upstream_and_downstream() {
        let edges = vec![edge("raw.orders", "staging.orders"), edge("staging.orders", "mart.orders")];
        let g = LineageGraph::build(&edges).unwrap();

        assert_eq!(g.upstream(&Mrn::new("staging.orders")), vec![Mrn::new("raw.orders")]);
        assert_eq!(g.downstream(&Mrn::new("staging.orders")), vec![Mrn::new("mart.orders")]);
        assert!(g.upstream(&Mrn::new("raw.orders")).is_empty());
    }

    #[test]
    fn transitive_closure() {
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("c", "d")];
        let g = LineageGraph::build(&edges).unwrap();

        let mut up = g.all_upstream(&Mrn::new("d"));
        up.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(up, vec![Mrn::new("a"), Mrn::new("b"), Mrn::new("c")]);

        let mut down = g.all_downstream(&Mrn::new("a"));
        down.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(down, vec![Mrn::new("b"), Mrn::new("c"), Mrn::new("d")]);
    }

    #[test]
    fn unknown_asset_has_empty_neighbors() {
        let g = LineageGraph::build(&[]).unwrap();
        assert!(g.upstream(&Mrn::new("ghost")).is_empty());
        assert!(g.downstream(&Mrn::new("ghost")).is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let edges = vec![edge("a", "b"), edge("b", "a")];
        assert!(matches!(LineageGraph::build(&edges), Err(GraphError::CycleDetected(_))));
    }
}
