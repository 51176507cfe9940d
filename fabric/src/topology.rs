// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{Direction, NodeId};
use itertools::Itertools;
use petgraph::prelude::*;

/// The neighbor links of a `rows x columns` grid.
///
/// Nodes are kept in a flat row-major array and every directed link is a
/// graph edge; the edge index doubles as the index of the channel that
/// models the link.
///
/// <pre>
/// (0,0) -- (0,1) -- (0,2)
///   |        |        |
/// (1,0) -- (1,1) -- (1,2)
///   |        |        |
///  [egress] [egress] [egress]
/// </pre>
#[derive(Clone, Debug)]
pub struct Topology {
    rows: usize,
    columns: usize,
    graph: Graph<NodeId, Direction>,
    /// Per node, the edge leaving through each compass port.
    outbound: Vec<[Option<EdgeIndex>; 4]>,
    /// Per node, the edge arriving on each side.
    inbound: Vec<[Option<EdgeIndex>; 4]>,
}

impl Topology {
    pub fn new(rows: usize, columns: usize) -> Self {
        let mut graph = Graph::new();
        let count = rows * columns;
        for (row, column) in (0..rows).cartesian_product(0..columns) {
            graph.add_node(NodeId::new(row, column));
        }
        let mut outbound = vec![[None; 4]; count];
        let mut inbound = vec![[None; 4]; count];
        for index in 0..count {
            let id = NodeId::delinearize(index, columns);
            for &direction in Direction::ALL.iter() {
                let neighbor = match id.step(direction) {
                    Some(n) if n.row < rows && n.column < columns => n,
                    _ => continue,
                };
                let there = neighbor.linearize(columns);
                let edge = graph.add_edge(node_index(index), node_index(there), direction);
                outbound[index][direction.index()] = Some(edge);
                inbound[there][direction.opposite().index()] = Some(edge);
            }
        }
        log::debug!(
            "topology {}x{}: {} nodes, {} links",
            rows,
            columns,
            graph.node_count(),
            graph.edge_count()
        );
        Self {
            rows,
            columns,
            graph,
            outbound,
            inbound,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn link_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.row < self.rows && id.column < self.columns
    }

    pub fn index(&self, id: NodeId) -> usize {
        id.linearize(self.columns)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().map(move |n| self.graph[n])
    }

    pub fn outbound(&self, id: NodeId, direction: Direction) -> Option<EdgeIndex> {
        self.outbound[self.index(id)][direction.index()]
    }

    /// The link delivering words to `id` on its `side`.
    pub fn inbound(&self, id: NodeId, side: Direction) -> Option<EdgeIndex> {
        self.inbound[self.index(id)][side.index()]
    }

    pub fn neighbor(&self, id: NodeId, direction: Direction) -> Option<NodeId> {
        self.outbound(id, direction)
            .and_then(|edge| self.graph.edge_endpoints(edge))
            .map(|(_, there)| self.graph[there])
    }

    pub fn graph(&self) -> &Graph<NodeId, Direction> {
        &self.graph
    }
}

fn node_index(index: usize) -> NodeIndex {
    NodeIndex::new(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_links() {
        let topology = Topology::new(3, 4);
        assert_eq!(topology.node_count(), 12);
        // horizontal: 3 rows * 3 pairs, vertical: 2 pairs * 4 columns, both ways
        assert_eq!(topology.link_count(), 2 * (3 * 3 + 2 * 4));
        let corner = NodeId::new(0, 0);
        assert_eq!(topology.outbound(corner, Direction::North), None);
        assert_eq!(topology.outbound(corner, Direction::West), None);
        assert_eq!(
            topology.neighbor(corner, Direction::East),
            Some(NodeId::new(0, 1))
        );
        assert_eq!(
            topology.neighbor(NodeId::new(1, 3), Direction::South),
            Some(NodeId::new(2, 3))
        );
        assert_eq!(topology.neighbor(NodeId::new(2, 3), Direction::South), None);
        assert_eq!(topology.neighbor(NodeId::new(2, 3), Direction::East), None);
    }

    #[test]
    fn inbound_matches_outbound() {
        let topology = Topology::new(4, 4);
        for id in topology.ids() {
            for &direction in Direction::ALL.iter() {
                if let Some(there) = topology.neighbor(id, direction) {
                    assert_eq!(
                        topology.inbound(there, direction.opposite()),
                        topology.outbound(id, direction)
                    );
                }
            }
        }
        let ids = topology.ids().collect::<Vec<_>>();
        assert_eq!(ids[5], NodeId::new(1, 1));
        assert_eq!(topology.index(ids[5]), 5);
    }
}
