//! Arena twin graph
//!
//! Twins live in a `Vec` and edges refer to them by index, with per-node
//! incoming and outgoing edge lists. Distance search is an iterative
//! breadth-first walk with a visited set, so cyclic and dense graphs are
//! safe to traverse.

use crate::error::{ModelError, Result};
use crate::twin::{Relation, RelationKind, Twin};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub type NodeIndex = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub kind: RelationKind,
}

/// Serialized form of a graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    pub twins: Vec<Twin>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

#[derive(Debug, Clone, Default)]
pub struct TwinGraph {
    nodes: Vec<Twin>,
    index: FxHashMap<String, NodeIndex>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl TwinGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: GraphDocument) -> Result<Self> {
        let mut graph = Self::new();
        for twin in document.twins {
            graph.add_twin(twin);
        }
        for relation in document.relations {
            graph.add_relation(&relation.source, relation.kind, &relation.target)?;
        }
        Ok(graph)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_document(serde_json::from_str(json)?)
    }

    pub fn to_document(&self) -> GraphDocument {
        GraphDocument {
            twins: self.nodes.clone(),
            relations: self
                .edges
                .iter()
                .map(|e| Relation {
                    source: self.nodes[e.source].id.clone(),
                    target: self.nodes[e.target].id.clone(),
                    kind: e.kind.clone(),
                })
                .collect(),
        }
    }

    /// Insert a twin, replacing the data of an existing twin with the same id
    pub fn add_twin(&mut self, twin: Twin) -> NodeIndex {
        if let Some(&idx) = self.index.get(&twin.id) {
            self.nodes[idx] = twin;
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(twin.id.clone(), idx);
        self.nodes.push(twin);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        idx
    }

    pub fn add_relation(
        &mut self,
        source: &str,
        kind: impl Into<RelationKind>,
        target: &str,
    ) -> Result<()> {
        let s = self
            .index_of(source)
            .ok_or_else(|| ModelError::unknown_twin(source))?;
        let t = self
            .index_of(target)
            .ok_or_else(|| ModelError::unknown_twin(target))?;
        let kind = kind.into();
        if self.outgoing[s]
            .iter()
            .any(|&e| self.edges[e].target == t && self.edges[e].kind == kind)
        {
            return Ok(());
        }
        let edge = self.edges.len();
        self.edges.push(Edge {
            source: s,
            target: t,
            kind,
        });
        self.outgoing[s].push(edge);
        self.incoming[t].push(edge);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &Twin {
        &self.nodes[idx]
    }

    pub fn twin(&self, id: &str) -> Option<&Twin> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn twins(&self) -> impl Iterator<Item = (NodeIndex, &Twin)> {
        self.nodes.iter().enumerate()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Twins directly attached to `idx`
    ///
    /// These are the twins whose relations point at `idx` (capabilities,
    /// parts, occupants), plus the twins `idx` feeds.
    pub fn direct_relations(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let incoming = self.incoming[idx]
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| !e.kind.is_forward())
            .map(|e| e.source);
        let feeds = self.outgoing[idx]
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| e.kind.is_forward())
            .map(|e| e.target);

        let mut result = Vec::new();
        for node in incoming.chain(feeds) {
            if node != idx && !result.contains(&node) {
                result.push(node);
            }
        }
        result
    }

    /// Targets of `kind` relations leaving `idx`
    pub fn follow(&self, idx: NodeIndex, kind: &RelationKind) -> Vec<NodeIndex> {
        self.outgoing[idx]
            .iter()
            .map(|&e| &self.edges[e])
            .filter(|e| &e.kind == kind)
            .map(|e| e.target)
            .collect()
    }

    /// Neighbours in either direction
    pub fn neighbors(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        let out = self.outgoing[idx].iter().map(|&e| self.edges[e].target);
        let inc = self.incoming[idx].iter().map(|&e| self.edges[e].source);
        out.chain(inc)
    }

    /// Every reachable twin grouped by hop distance, nearest first
    ///
    /// The start node itself is not included. Edges are walked in both
    /// directions.
    pub fn nodes_by_distance(&self, start: NodeIndex) -> Vec<Vec<NodeIndex>> {
        let mut distance: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut groups: Vec<Vec<NodeIndex>> = Vec::new();
        let mut queue = VecDeque::new();

        if start >= self.nodes.len() {
            return groups;
        }
        distance[start] = Some(0);
        queue.push_back(start);

        while let Some(node) = queue.pop_front() {
            let d = distance[node].unwrap_or(0);
            for next in self.neighbors(node) {
                if distance[next].is_some() {
                    continue;
                }
                distance[next] = Some(d + 1);
                if groups.len() < d + 1 {
                    groups.push(Vec::new());
                }
                groups[d].push(next);
                queue.push_back(next);
            }
        }
        groups
    }

    /// Subgraph of everything within `hops` of the seeds
    pub fn neighborhood(&self, seeds: &[&str], hops: usize) -> TwinGraph {
        let mut keep = vec![false; self.nodes.len()];
        let mut queue: VecDeque<(NodeIndex, usize)> = VecDeque::new();
        for seed in seeds {
            if let Some(idx) = self.index_of(seed) {
                if !keep[idx] {
                    keep[idx] = true;
                    queue.push_back((idx, 0));
                }
            }
        }
        while let Some((node, d)) = queue.pop_front() {
            if d >= hops {
                continue;
            }
            for next in self.neighbors(node) {
                if !keep[next] {
                    keep[next] = true;
                    queue.push_back((next, d + 1));
                }
            }
        }

        let mut sub = TwinGraph::new();
        for (idx, twin) in self.twins() {
            if keep[idx] {
                sub.add_twin(twin.clone());
            }
        }
        for edge in &self.edges {
            if keep[edge.source] && keep[edge.target] {
                // Both ends were just inserted
                let _ = sub.add_relation(
                    &self.nodes[edge.source].id,
                    edge.kind.clone(),
                    &self.nodes[edge.target].id,
                );
            }
        }
        sub
    }
}
