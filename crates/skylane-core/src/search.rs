//! Shortest-path search (Dijkstra / A*) over any [`SearchGraph`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

use crate::error::DeadlineExceeded;
use crate::models::Coordinate;

/// Deadline is checked once per this many units of work.
const DEADLINE_POLL_INTERVAL: usize = 256;

/// Optional deadline polled every [`DEADLINE_POLL_INTERVAL`] ticks, so hot
/// loops do not read the clock on every iteration.
#[derive(Debug, Clone)]
pub struct DeadlineClock {
    deadline: Option<Instant>,
    ticks: usize,
}

impl DeadlineClock {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline, ticks: 0 }
    }

    /// Count one unit of work. Fails once the deadline has passed.
    pub fn tick(&mut self) -> Result<(), DeadlineExceeded> {
        self.ticks += 1;
        if self.ticks % DEADLINE_POLL_INTERVAL == 0 && self.expired() {
            return Err(DeadlineExceeded);
        }
        Ok(())
    }

    /// Read the clock now, regardless of the tick count.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Graph view used by [`shortest_path`]. Edges may be produced lazily.
pub trait SearchGraph {
    fn position(&self, id: usize) -> Coordinate;

    /// Push `(neighbor, cost_m)` pairs for `id` into `out`.
    fn neighbors(&self, id: usize, out: &mut Vec<(usize, f64)>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristic {
    /// Plain Dijkstra.
    None,
    /// A* with straight-line geodesic distance to the goal. Admissible as
    /// long as every edge costs at least its geodesic length.
    Geodesic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPath {
    pub nodes: Vec<usize>,
    pub cost: f64,
    pub nodes_visited: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFailure {
    /// Open set exhausted without reaching the goal.
    Disconnected { nodes_visited: usize },
    DeadlineExceeded { nodes_visited: usize },
}

impl SearchFailure {
    pub fn nodes_visited(&self) -> usize {
        match self {
            SearchFailure::Disconnected { nodes_visited }
            | SearchFailure::DeadlineExceeded { nodes_visited } => *nodes_visited,
        }
    }
}

impl From<DeadlineExceeded> for SearchFailure {
    fn from(_: DeadlineExceeded) -> Self {
        SearchFailure::DeadlineExceeded { nodes_visited: 0 }
    }
}

#[derive(Debug, Clone, Copy)]
struct FloatOrd(f64);

impl PartialEq for FloatOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatOrd {}

impl PartialOrd for FloatOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenNode {
    id: usize,
    g_score: FloatOrd,
    f_score: FloatOrd,
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f_score
            .cmp(&other.f_score)
            .then_with(|| self.g_score.cmp(&other.g_score))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Minimal-cost path from `start` to `goal`.
///
/// Stale heap entries are skipped instead of decreased in place. When a
/// `deadline` is given it is polled periodically and the search gives up
/// with [`SearchFailure::DeadlineExceeded`] once it passes.
pub fn shortest_path<G: SearchGraph + ?Sized>(
    graph: &G,
    start: usize,
    goal: usize,
    heuristic: Heuristic,
    deadline: Option<Instant>,
) -> Result<SearchPath, SearchFailure> {
    let goal_pos = graph.position(goal);
    let estimate = |id: usize| match heuristic {
        Heuristic::None => 0.0,
        Heuristic::Geodesic => graph.position(id).distance_to(&goal_pos),
    };

    let mut open_set: BinaryHeap<Reverse<OpenNode>> = BinaryHeap::new();
    open_set.push(Reverse(OpenNode {
        id: start,
        g_score: FloatOrd(0.0),
        f_score: FloatOrd(estimate(start)),
    }));
    let mut closed_set: HashSet<usize> = HashSet::new();
    let mut g_score: HashMap<usize, f64> = HashMap::new();
    let mut came_from: HashMap<usize, usize> = HashMap::new();
    g_score.insert(start, 0.0);

    let mut nodes_visited = 0usize;
    let mut neighbors = Vec::new();
    let mut clock = DeadlineClock::new(deadline);

    while let Some(Reverse(current)) = open_set.pop() {
        if closed_set.contains(&current.id) {
            continue;
        }
        let best_g = g_score.get(&current.id).copied().unwrap_or(f64::INFINITY);
        if current.g_score.0 > best_g + 1e-9 {
            continue;
        }

        nodes_visited += 1;
        if clock.tick().is_err() {
            return Err(SearchFailure::DeadlineExceeded { nodes_visited });
        }

        if current.id == goal {
            return Ok(SearchPath {
                nodes: reconstruct(&came_from, goal),
                cost: best_g,
                nodes_visited,
            });
        }

        closed_set.insert(current.id);
        neighbors.clear();
        graph.neighbors(current.id, &mut neighbors);
        for &(next, cost) in &neighbors {
            if closed_set.contains(&next) || !cost.is_finite() {
                continue;
            }
            let tentative_g = best_g + cost;
            let known = g_score.get(&next).copied().unwrap_or(f64::INFINITY);
            if tentative_g + 1e-9 < known {
                came_from.insert(next, current.id);
                g_score.insert(next, tentative_g);
                open_set.push(Reverse(OpenNode {
                    id: next,
                    g_score: FloatOrd(tentative_g),
                    f_score: FloatOrd(tentative_g + estimate(next)),
                }));
            }
        }
    }

    Err(SearchFailure::Disconnected { nodes_visited })
}

fn reconstruct(came_from: &HashMap<usize, usize>, goal: usize) -> Vec<usize> {
    let mut path = vec![goal];
    let mut current = goal;
    while let Some(&prev) = came_from.get(&current) {
        path.push(prev);
        current = prev;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Nodes on the equator, explicit undirected edges.
    struct LineGraph {
        positions: Vec<Coordinate>,
        edges: Vec<(usize, usize, f64)>,
    }

    impl SearchGraph for LineGraph {
        fn position(&self, id: usize) -> Coordinate {
            self.positions[id]
        }

        fn neighbors(&self, id: usize, out: &mut Vec<(usize, f64)>) {
            for &(a, b, cost) in &self.edges {
                if a == id {
                    out.push((b, cost));
                } else if b == id {
                    out.push((a, cost));
                }
            }
        }
    }

    fn diamond() -> LineGraph {
        let positions = vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.01, 0.01),
            Coordinate::new(0.01, -0.02),
            Coordinate::new(0.02, 0.0),
        ];
        let cost = |a: usize, b: usize| positions[a].distance_to(&positions[b]);
        let edges = vec![
            (0, 1, cost(0, 1)),
            (1, 3, cost(1, 3)),
            (0, 2, cost(0, 2)),
            (2, 3, cost(2, 3)),
        ];
        LineGraph { positions, edges }
    }

    #[test]
    fn astar_and_dijkstra_agree_on_cost() {
        let graph = diamond();
        let astar = shortest_path(&graph, 0, 3, Heuristic::Geodesic, None).unwrap();
        let dijkstra = shortest_path(&graph, 0, 3, Heuristic::None, None).unwrap();
        assert_eq!(astar.nodes, vec![0, 1, 3]);
        assert_eq!(dijkstra.nodes, vec![0, 1, 3]);
        assert!((astar.cost - dijkstra.cost).abs() < 1e-6);
    }

    #[test]
    fn disconnected_goal_fails() {
        let mut graph = diamond();
        graph.edges.retain(|&(_, b, _)| b != 3);
        let err = shortest_path(&graph, 0, 3, Heuristic::Geodesic, None).unwrap_err();
        assert!(matches!(err, SearchFailure::Disconnected { nodes_visited: 3 }));
    }

    #[test]
    fn start_equal_goal_is_trivial() {
        let graph = diamond();
        let path = shortest_path(&graph, 2, 2, Heuristic::Geodesic, None).unwrap();
        assert_eq!(path.nodes, vec![2]);
        assert_eq!(path.cost, 0.0);
    }

    #[test]
    fn expired_deadline_aborts_long_search() {
        // Long chain so the poll interval is reached.
        let positions: Vec<Coordinate> =
            (0..2_000).map(|i| Coordinate::new(i as f64 * 1e-4, 0.0)).collect();
        let edges = (0..1_999).map(|i| (i, i + 1, 11.0)).collect();
        let graph = LineGraph { positions, edges };
        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        let err = shortest_path(&graph, 0, 1_999, Heuristic::None, Some(past)).unwrap_err();
        assert!(matches!(err, SearchFailure::DeadlineExceeded { .. }));
    }

    #[test]
    fn clock_polls_on_interval() {
        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        let mut clock = DeadlineClock::new(Some(past));
        assert!(clock.expired());
        for _ in 1..DEADLINE_POLL_INTERVAL {
            assert_eq!(clock.tick(), Ok(()));
        }
        assert_eq!(clock.tick(), Err(DeadlineExceeded));

        let mut unbounded = DeadlineClock::new(None);
        assert!((0..DEADLINE_POLL_INTERVAL * 2).all(|_| unbounded.tick().is_ok()));
    }
}
