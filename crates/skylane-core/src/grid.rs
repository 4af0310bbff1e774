//! Dense-lattice fallback for when the visibility graph cannot connect.

use std::collections::HashSet;
use std::time::Instant;

use crate::error::DeadlineExceeded;
use crate::geometry::{Bbox, ObstacleSet};
use crate::models::Coordinate;
use crate::search::{DeadlineClock, SearchGraph};
use crate::spatial::{LocalFrame, Xy};
use crate::terrain::TerrainPolicy;

/// Start and goal links reach this many cells out from their own cell.
const LINK_RADIUS_CELLS: isize = 2;

const NEIGHBOR_OFFSETS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Half of [`NEIGHBOR_OFFSETS`]; each undirected lattice edge once.
const FORWARD_OFFSETS: [(isize, isize); 4] = [(1, 0), (-1, 1), (0, 1), (1, 1)];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSettings {
    pub max_cells: usize,
    pub min_cell_m: f64,
    pub span_divisions: f64,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            max_cells: 250_000,
            min_cell_m: 1.0,
            span_divisions: 200.0,
        }
    }
}

fn lattice_dims(width_m: f64, height_m: f64, cell_m: f64) -> (usize, usize) {
    (
        (width_m / cell_m).ceil() as usize + 1,
        (height_m / cell_m).ceil() as usize + 1,
    )
}

/// Cell size for a `width_m` x `height_m` lattice.
///
/// Starts at the corridor width (finer for narrow corridors), never below
/// `span / span_divisions` or `min_cell_m`, then grows until the lattice
/// fits in `max_cells`.
pub fn resolve_cell_size(
    width_m: f64,
    height_m: f64,
    corridor_width_m: f64,
    settings: &GridSettings,
) -> f64 {
    let span = width_m.max(height_m);
    let mut cell = corridor_width_m
        .max(span / settings.span_divisions.max(1.0))
        .max(settings.min_cell_m.max(1e-3));
    loop {
        let (cols, rows) = lattice_dims(width_m, height_m, cell);
        if cols.saturating_mul(rows) <= settings.max_cells.max(1) {
            return cell;
        }
        cell *= 1.5;
    }
}

/// Geometry of a uniform lattice: which cells are free and how start and
/// goal attach. Terrain is applied later by [`GridLattice`].
///
/// Lattice nodes are numbered row-major; the start and goal come right after
/// them and are linked to free lattice nodes within a couple of cells.
#[derive(Debug, Clone)]
pub struct GridLayout {
    frame: LocalFrame,
    origin: Xy,
    cell_m: f64,
    cols: usize,
    rows: usize,
    free: Vec<bool>,
    start: Coordinate,
    goal: Coordinate,
    start_links: Vec<usize>,
    goal_links: HashSet<usize>,
}

impl GridLayout {
    /// Lay the lattice over the bbox of start, goal and all buffered zones,
    /// padded by `pad_m`. Classifying cells polls `deadline`.
    pub fn build(
        start: Coordinate,
        goal: Coordinate,
        obstacles: &ObstacleSet,
        settings: &GridSettings,
        pad_m: f64,
        deadline: Option<Instant>,
    ) -> Result<Self, DeadlineExceeded> {
        let mut clock = DeadlineClock::new(deadline);
        let frame = *obstacles.frame();
        let start_xy = frame.project(start);
        let goal_xy = frame.project(goal);
        let mut bbox = Bbox::around(start_xy).include(goal_xy);
        if let Some(zones) = obstacles.bbox() {
            bbox = bbox.union(zones);
        }
        let bbox = bbox.expanded(pad_m.max(0.0));

        let cell_m = resolve_cell_size(
            bbox.width(),
            bbox.height(),
            obstacles.corridor_width_m(),
            settings,
        );
        let (cols, rows) = lattice_dims(bbox.width(), bbox.height(), cell_m);

        let mut layout = Self {
            frame,
            origin: bbox.min,
            cell_m,
            cols,
            rows,
            free: Vec::new(),
            start,
            goal,
            start_links: Vec::new(),
            goal_links: HashSet::new(),
        };
        let mut free = Vec::with_capacity(cols * rows);
        for idx in 0..cols * rows {
            clock.tick()?;
            free.push(!obstacles.point_blocked(layout.node_point(idx)));
        }
        layout.free = free;
        layout.start_links = layout.free_nodes_near(start_xy);
        layout.goal_links = layout.free_nodes_near(goal_xy).into_iter().collect();
        Ok(layout)
    }

    pub fn cell_m(&self) -> f64 {
        self.cell_m
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    pub fn lattice_len(&self) -> usize {
        self.cols * self.rows
    }

    pub fn start_node(&self) -> usize {
        self.lattice_len()
    }

    pub fn goal_node(&self) -> usize {
        self.lattice_len() + 1
    }

    pub fn free_count(&self) -> usize {
        self.free.iter().filter(|free| **free).count()
    }

    /// Every segment [`GridLattice`] may cost: lattice edges between free
    /// nodes plus the start and goal links, each once.
    pub fn segments(&self) -> impl Iterator<Item = (Coordinate, Coordinate)> + '_ {
        let lattice = (0..self.lattice_len())
            .filter(|idx| self.free[*idx])
            .flat_map(move |idx| {
                let col = (idx % self.cols) as isize;
                let row = (idx / self.cols) as isize;
                FORWARD_OFFSETS.into_iter().filter_map(move |(dc, dr)| {
                    let next = self.index(col + dc, row + dr)?;
                    self.free[next].then(|| (self.node_coordinate(idx), self.node_coordinate(next)))
                })
            });
        let start_links = self
            .start_links
            .iter()
            .map(|&idx| (self.start, self.node_coordinate(idx)));
        let goal_links = self
            .goal_links
            .iter()
            .map(|&idx| (self.node_coordinate(idx), self.goal));
        lattice.chain(start_links).chain(goal_links)
    }

    pub fn position(&self, id: usize) -> Coordinate {
        match id {
            id if id == self.start_node() => self.start,
            id if id == self.goal_node() => self.goal,
            id => self.node_coordinate(id),
        }
    }

    /// Local-frame point of `id`, derived from its coordinate so checks
    /// agree with anything re-projecting the final route.
    pub fn point(&self, id: usize) -> Xy {
        self.frame.project(self.position(id))
    }

    fn node_coordinate(&self, idx: usize) -> Coordinate {
        let col = idx % self.cols;
        let row = idx / self.cols;
        self.frame.unproject((
            self.origin.0 + col as f64 * self.cell_m,
            self.origin.1 + row as f64 * self.cell_m,
        ))
    }

    fn node_point(&self, idx: usize) -> Xy {
        self.frame.project(self.node_coordinate(idx))
    }

    fn cell_of(&self, point: Xy) -> (isize, isize) {
        (
            ((point.0 - self.origin.0) / self.cell_m).round() as isize,
            ((point.1 - self.origin.1) / self.cell_m).round() as isize,
        )
    }

    fn index(&self, col: isize, row: isize) -> Option<usize> {
        if col < 0 || row < 0 || col as usize >= self.cols || row as usize >= self.rows {
            return None;
        }
        Some(row as usize * self.cols + col as usize)
    }

    fn free_nodes_near(&self, point: Xy) -> Vec<usize> {
        let (col, row) = self.cell_of(point);
        let mut out = Vec::new();
        for dr in -LINK_RADIUS_CELLS..=LINK_RADIUS_CELLS {
            for dc in -LINK_RADIUS_CELLS..=LINK_RADIUS_CELLS {
                if let Some(idx) = self.index(col + dc, row + dr) {
                    if self.free[idx] {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}

/// A [`GridLayout`] searched against obstacles and terrain. Edges are
/// evaluated lazily as the search expands nodes.
pub struct GridLattice<'a> {
    layout: &'a GridLayout,
    obstacles: &'a ObstacleSet,
    terrain: &'a TerrainPolicy<'a>,
}

impl<'a> GridLattice<'a> {
    pub fn new(
        layout: &'a GridLayout,
        obstacles: &'a ObstacleSet,
        terrain: &'a TerrainPolicy<'a>,
    ) -> Self {
        Self {
            layout,
            obstacles,
            terrain,
        }
    }

    pub fn layout(&self) -> &GridLayout {
        self.layout
    }

    fn link(&self, from: usize, to: usize, out: &mut Vec<(usize, f64)>) {
        let layout = self.layout;
        if self.obstacles.segment_blocked(layout.point(from), layout.point(to)) {
            return;
        }
        if let Some(cost) = self.terrain.edge_cost(layout.position(from), layout.position(to)) {
            out.push((to, cost));
        }
    }
}

impl SearchGraph for GridLattice<'_> {
    fn position(&self, id: usize) -> Coordinate {
        self.layout.position(id)
    }

    fn neighbors(&self, id: usize, out: &mut Vec<(usize, f64)>) {
        let layout = self.layout;
        if id == layout.start_node() {
            for &idx in &layout.start_links {
                self.link(id, idx, out);
            }
            return;
        }
        if id >= layout.lattice_len() || !layout.free[id] {
            return;
        }

        let col = (id % layout.cols) as isize;
        let row = (id / layout.cols) as isize;
        for (dc, dr) in NEIGHBOR_OFFSETS {
            if let Some(next) = layout.index(col + dc, row + dr) {
                if layout.free[next] {
                    self.link(id, next, out);
                }
            }
        }
        if layout.goal_links.contains(&id) {
            self.link(id, layout.goal_node(), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Zone;
    use crate::search::{shortest_path, Heuristic};
    use crate::spatial::LocalFrame;
    use crate::terrain::{SampleSpacing, TerrainMode};

    const SPACING: SampleSpacing = SampleSpacing {
        step_m: 250.0,
        min_samples: 10,
        max_samples: 64,
    };

    fn rect(frame: &LocalFrame, min: Xy, max: Xy) -> Zone {
        Zone::polygon(
            [min, (max.0, min.1), max, (min.0, max.1)]
                .into_iter()
                .map(|p| frame.unproject(p))
                .collect(),
        )
    }

    #[test]
    fn cell_size_grows_to_fit_budget() {
        let settings = GridSettings {
            max_cells: 100,
            min_cell_m: 1.0,
            span_divisions: 200.0,
        };
        let cell = resolve_cell_size(1_000.0, 1_000.0, 10.0, &settings);
        let (cols, rows) = lattice_dims(1_000.0, 1_000.0, cell);
        assert!(cols * rows <= 100);
        assert!(cell > 10.0);

        let fine = resolve_cell_size(1_000.0, 1_000.0, 10.0, &GridSettings::default());
        assert_eq!(fine, 10.0);
    }

    #[test]
    fn lattice_finds_way_through_gap() {
        let frame = LocalFrame::new(Coordinate::new(0.0, 0.0));
        // Wall with a single gap between y = -20 and y = 20.
        let zones = vec![
            rect(&frame, (-10.0, 20.0), (10.0, 400.0)),
            rect(&frame, (-10.0, -400.0), (10.0, -20.0)),
        ];
        let obstacles = ObstacleSet::build(frame, &zones, 4.0, 1.0);
        let flat = |_: Coordinate| Some(0.0);
        let policy = TerrainPolicy::new(&flat, TerrainMode::Ceiling(100.0), SPACING);
        let start = frame.unproject((-200.0, 150.0));
        let goal = frame.unproject((200.0, 150.0));
        let layout =
            GridLayout::build(start, goal, &obstacles, &GridSettings::default(), 10.0, None).unwrap();
        assert!(layout.free_count() < layout.lattice_len());
        let lattice = GridLattice::new(&layout, &obstacles, &policy);

        let path = shortest_path(
            &lattice,
            layout.start_node(),
            layout.goal_node(),
            Heuristic::Geodesic,
            None,
        )
        .unwrap();
        for pair in path.nodes.windows(2) {
            assert!(!obstacles.segment_blocked(layout.point(pair[0]), layout.point(pair[1])));
        }
        let passes_gap = path
            .nodes
            .iter()
            .any(|&id| layout.point(id).1.abs() < 20.0 && layout.point(id).0.abs() < 30.0);
        assert!(passes_gap);
    }

    #[test]
    fn enclosed_start_has_no_lattice_path() {
        let frame = LocalFrame::new(Coordinate::new(0.0, 0.0));
        let zones = vec![rect(&frame, (-100.0, -100.0), (100.0, 100.0))];
        let obstacles = ObstacleSet::build(frame, &zones, 10.0, 5.0);
        let flat = |_: Coordinate| Some(0.0);
        let policy = TerrainPolicy::new(&flat, TerrainMode::Ignore, SPACING);
        let layout = GridLayout::build(
            frame.unproject((0.0, 0.0)),
            frame.unproject((500.0, 0.0)),
            &obstacles,
            &GridSettings::default(),
            20.0,
            None,
        )
        .unwrap();
        let lattice = GridLattice::new(&layout, &obstacles, &policy);
        let result = shortest_path(
            &lattice,
            layout.start_node(),
            layout.goal_node(),
            Heuristic::Geodesic,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn segments_cover_every_costed_link() {
        let frame = LocalFrame::new(Coordinate::new(0.0, 0.0));
        let zones = vec![rect(&frame, (-50.0, -50.0), (50.0, 50.0))];
        let obstacles = ObstacleSet::build(frame, &zones, 10.0, 5.0);
        let settings = GridSettings {
            max_cells: 400,
            ..GridSettings::default()
        };
        let layout = GridLayout::build(
            frame.unproject((-150.0, 0.0)),
            frame.unproject((150.0, 0.0)),
            &obstacles,
            &settings,
            20.0,
            None,
        )
        .unwrap();
        let flat = |_: Coordinate| Some(0.0);
        let policy = TerrainPolicy::new(&flat, TerrainMode::Ignore, SPACING);
        let lattice = GridLattice::new(&layout, &obstacles, &policy);
        let segments: Vec<(Coordinate, Coordinate)> = layout.segments().collect();
        let mut neighbors = Vec::new();
        for id in 0..layout.goal_node() {
            neighbors.clear();
            lattice.neighbors(id, &mut neighbors);
            for &(next, _) in &neighbors {
                let (a, b) = (layout.position(id), layout.position(next));
                assert!(
                    segments.contains(&(a, b)) || segments.contains(&(b, a)),
                    "link {id} -> {next} not listed"
                );
            }
        }
    }

    #[test]
    fn expired_deadline_stops_layout() {
        let frame = LocalFrame::new(Coordinate::new(0.0, 0.0));
        let zones = vec![rect(&frame, (-100.0, -100.0), (100.0, 100.0))];
        let obstacles = ObstacleSet::build(frame, &zones, 1.0, 1.0);
        let past = Instant::now()
            .checked_sub(std::time::Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        let result = GridLayout::build(
            frame.unproject((-500.0, 0.0)),
            frame.unproject((500.0, 0.0)),
            &obstacles,
            &GridSettings::default(),
            20.0,
            Some(past),
        );
        assert_eq!(result.err(), Some(DeadlineExceeded));
    }
}
