use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef, Reversed};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet};

use super::{EdgeKind, ResourceId, ResourceNode};
use crate::util::ProvisionError;

/// Acyclic resource graph. Edges point from prerequisite to dependent.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    graph: DiGraph<ResourceNode, EdgeKind>,
    index: BTreeMap<ResourceId, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl ResourceGraph {
    pub fn build(nodes: Vec<ResourceNode>) -> Result<Self, ProvisionError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();
        for node in nodes {
            let id = node.id.clone();
            if index.contains_key(&id) {
                return Err(ProvisionError::validation(format!("resource id {id} is declared twice")));
            }
            index.insert(id, graph.add_node(node));
        }

        let mut edges = Vec::new();
        for (id, &to) in &index {
            for dep in &graph[to].depends_on {
                if dep.id == *id {
                    return Err(ProvisionError::validation(format!("{id} depends on itself")));
                }
                let from = *index.get(&dep.id).ok_or_else(|| {
                    ProvisionError::validation(format!("{id} depends on unknown resource {}", dep.id))
                })?;
                edges.push((from, to, dep.kind));
            }
        }
        for (from, to, kind) in edges {
            match graph.find_edge(from, to) {
                // A pair declared both ways keeps the data edge.
                Some(existing) => {
                    if kind == EdgeKind::Data {
                        graph[existing] = EdgeKind::Data;
                    }
                }
                None => {
                    graph.add_edge(from, to, kind);
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            ProvisionError::validation(format!(
                "dependency cycle through {}",
                graph[cycle.node_id()].id
            ))
        })?;

        Ok(Self { graph, index, order })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&ix| &self.graph[ix])
    }

    /// Nodes in a stable topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().map(move |&ix| &self.graph[ix])
    }

    pub fn topological_order(&self) -> Vec<ResourceId> {
        self.nodes().map(|n| n.id.clone()).collect()
    }

    /// Direct prerequisites of `id` with the kind of edge to each.
    pub fn prerequisites(&self, id: &ResourceId) -> Vec<(ResourceId, EdgeKind)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id` with the kind of edge to each.
    pub fn dependents(&self, id: &ResourceId) -> Vec<(ResourceId, EdgeKind)> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, dir: Direction) -> Vec<(ResourceId, EdgeKind)> {
        let Some(&ix) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<_> = self
            .graph
            .edges_directed(ix, dir)
            .map(|e| {
                let other = match dir {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (self.graph[other].id.clone(), *e.weight())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Everything reachable downstream of `id`, excluding `id`.
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let Some(&ix) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let mut seen = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, ix);
        while let Some(next) = bfs.next(&self.graph) {
            if next != ix {
                seen.insert(self.graph[next].id.clone());
            }
        }
        seen
    }

    /// Everything upstream of `id`, excluding `id`.
    pub fn transitive_prerequisites(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let Some(&ix) = self.index.get(id) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut seen = BTreeSet::new();
        let mut bfs = Bfs::new(reversed, ix);
        while let Some(next) = bfs.next(reversed) {
            if next != ix {
                seen.insert(self.graph[next].id.clone());
            }
        }
        seen
    }

    pub fn edges(&self) -> Vec<(ResourceId, ResourceId, EdgeKind)> {
        self.graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].id.clone(),
                    self.graph[e.target()].id.clone(),
                    *e.weight(),
                )
            })
            .collect()
    }
}
