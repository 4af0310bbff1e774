//! Visibility graph over start, end and zone offset nodes.

use std::time::Instant;

use crate::error::DeadlineExceeded;
use crate::geometry::{offset_nodes, ObstacleSet};
use crate::models::{Coordinate, GraphNode, NodeOrigin};
use crate::search::{DeadlineClock, SearchGraph};
use crate::spatial::Xy;
use crate::terrain::TerrainPolicy;

pub const START_NODE: usize = 0;
pub const END_NODE: usize = 1;

/// Collision-free edge, traversable both ways at possibly different cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub a: usize,
    pub b: usize,
    /// Cost of `a` -> `b`.
    pub forward_m: f64,
    /// Cost of `b` -> `a`.
    pub reverse_m: f64,
}

#[derive(Debug, Clone)]
pub struct VisibilityGraph {
    nodes: Vec<GraphNode>,
    points: Vec<Xy>,
    edges: Vec<Edge>,
    adjacency: Vec<Vec<usize>>,
}

/// Build nodes and every collision-free edge between them.
///
/// Offset nodes sitting inside any buffered zone are discarded. The pair
/// test is O(n^2) in node count, which tracks obstacle edge count rather
/// than area, so `deadline` is polled inside it.
pub fn build_visibility_graph(
    start: Coordinate,
    end: Coordinate,
    obstacles: &ObstacleSet,
    offset_m: f64,
    deadline: Option<Instant>,
) -> Result<VisibilityGraph, DeadlineExceeded> {
    let mut clock = DeadlineClock::new(deadline);
    let frame = obstacles.frame();
    let mut nodes = vec![
        GraphNode {
            id: START_NODE,
            coordinate: start,
            origin: NodeOrigin::Start,
        },
        GraphNode {
            id: END_NODE,
            coordinate: end,
            origin: NodeOrigin::End,
        },
    ];
    let mut points = vec![frame.project(start), frame.project(end)];

    for zone in obstacles.zones() {
        for mut node in offset_nodes(zone, frame, offset_m) {
            clock.tick()?;
            let point = frame.project(node.coordinate);
            if obstacles.point_blocked(point) {
                continue;
            }
            node.id = nodes.len();
            nodes.push(node);
            points.push(point);
        }
    }

    let mut edges = Vec::new();
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            clock.tick()?;
            if !obstacles.segment_blocked(points[i], points[j]) {
                let length_m = nodes[i].coordinate.distance_to(&nodes[j].coordinate);
                edges.push(Edge {
                    a: i,
                    b: j,
                    forward_m: length_m,
                    reverse_m: length_m,
                });
            }
        }
    }

    let mut graph = VisibilityGraph {
        nodes,
        points,
        edges,
        adjacency: Vec::new(),
    };
    graph.rebuild_adjacency();
    Ok(graph)
}

impl VisibilityGraph {
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn point(&self, id: usize) -> Xy {
        self.points[id]
    }

    /// Edge endpoints as coordinates; what [`Self::apply_terrain`] samples.
    pub fn segments(&self) -> impl Iterator<Item = (Coordinate, Coordinate)> + '_ {
        self.edges
            .iter()
            .map(|edge| (self.nodes[edge.a].coordinate, self.nodes[edge.b].coordinate))
    }

    /// Re-cost edges against terrain in both directions, dropping those that
    /// break the ceiling or cannot be verified.
    pub fn apply_terrain(
        &mut self,
        policy: &TerrainPolicy<'_>,
        deadline: Option<Instant>,
    ) -> Result<(), DeadlineExceeded> {
        let mut clock = DeadlineClock::new(deadline);
        let mut kept = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            clock.tick()?;
            let (a, b) = (self.nodes[edge.a].coordinate, self.nodes[edge.b].coordinate);
            if let Some((forward_m, reverse_m)) = policy.edge_costs(a, b) {
                kept.push(Edge {
                    forward_m,
                    reverse_m,
                    ..*edge
                });
            }
        }
        self.edges = kept;
        self.rebuild_adjacency();
        Ok(())
    }

    fn rebuild_adjacency(&mut self) {
        self.adjacency = vec![Vec::new(); self.nodes.len()];
        for (idx, edge) in self.edges.iter().enumerate() {
            self.adjacency[edge.a].push(idx);
            self.adjacency[edge.b].push(idx);
        }
    }
}

impl SearchGraph for VisibilityGraph {
    fn position(&self, id: usize) -> Coordinate {
        self.nodes[id].coordinate
    }

    fn neighbors(&self, id: usize, out: &mut Vec<(usize, f64)>) {
        for &edge_idx in &self.adjacency[id] {
            let edge = self.edges[edge_idx];
            if edge.a == id {
                out.push((edge.b, edge.forward_m));
            } else {
                out.push((edge.a, edge.reverse_m));
            }
        }
    }
}
