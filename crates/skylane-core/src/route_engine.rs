//! Route engine: direct check, visibility graph, grid fallback.
//!
//! [`PreparedRoute`] holds the per-request geometry and exposes each stage on
//! its own so async callers can prefetch terrain between stages.
//! [`plan_route`] runs the whole state machine against terrain that is
//! already resolved.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::densify::{bisection_points, densify_route};
use crate::error::{DeadlineExceeded, PlanError};
use crate::geometry::{buffer_route, ObstacleSet};
use crate::grid::{GridLattice, GridLayout, GridSettings};
use crate::models::{Coordinate, Route, RouteRequest};
use crate::search::{shortest_path, Heuristic, SearchFailure, SearchGraph};
use crate::smoothing::smooth_path;
use crate::spatial::LocalFrame;
use crate::terrain::{
    resolve_ceiling, ElevationLookup, ElevationWeights, SampleSpacing, TerrainMode, TerrainPolicy,
};
use crate::visibility::{build_visibility_graph, VisibilityGraph, END_NODE, START_NODE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEngineConfig {
    /// Added to half the corridor width when buffering zones.
    pub safety_epsilon_m: f64,
    /// Offset nodes sit this many corridor widths (or clearances) out.
    pub offset_factor: f64,
    pub elevation_margin_m: f64,
    pub slope_threshold: f64,
    pub densify: bool,
    pub densify_max_depth: u32,
    pub terrain_sample_step_m: f64,
    pub min_line_samples: usize,
    pub max_line_samples: usize,
    pub elevation_weighting: bool,
    pub climb_penalty: f64,
    pub descent_credit: f64,
    pub max_grid_cells: usize,
    pub grid_min_cell_m: f64,
    pub grid_span_divisions: f64,
}

impl Default for RouteEngineConfig {
    fn default() -> Self {
        Self {
            safety_epsilon_m: 5.0,
            offset_factor: 1.1,
            elevation_margin_m: 200.0,
            slope_threshold: 0.1,
            densify: true,
            densify_max_depth: 5,
            terrain_sample_step_m: 250.0,
            min_line_samples: 10,
            max_line_samples: 64,
            elevation_weighting: false,
            climb_penalty: 3.0,
            descent_credit: 1.0,
            max_grid_cells: 250_000,
            grid_min_cell_m: 1.0,
            grid_span_divisions: 200.0,
        }
    }
}

impl RouteEngineConfig {
    /// Apply per-request tuning on top of the service defaults.
    pub fn with_request_overrides(&self, request: &RouteRequest) -> Self {
        let mut config = self.clone();
        if let Some(margin) = request.elevation_margin {
            config.elevation_margin_m = margin;
        }
        if let Some(threshold) = request.slope_threshold {
            config.slope_threshold = threshold;
        }
        if let Some(densify) = request.densify {
            config.densify = densify;
        }
        if let Some(weighting) = request.elevation_weighting {
            config.elevation_weighting = weighting;
        }
        config
    }

    pub fn sample_spacing(&self) -> SampleSpacing {
        SampleSpacing {
            step_m: self.terrain_sample_step_m,
            min_samples: self.min_line_samples,
            max_samples: self.max_line_samples,
        }
    }

    pub fn elevation_weights(&self) -> Option<ElevationWeights> {
        self.elevation_weighting.then_some(ElevationWeights {
            climb_penalty: self.climb_penalty,
            descent_credit: self.descent_credit,
        })
    }

    pub fn grid_settings(&self) -> GridSettings {
        GridSettings {
            max_cells: self.max_grid_cells,
            min_cell_m: self.grid_min_cell_m,
            span_divisions: self.grid_span_divisions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStage {
    Direct,
    VisibilityGraph,
    Grid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    NoPathFound,
    ElevationUnavailable,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub route: Route,
    pub stage: RouteStage,
    /// Route buffered by the corridor width; `None` for a zero width.
    pub corridor: Option<Vec<Coordinate>>,
    pub nodes_visited: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RouteOutcome {
    Found(PlannedRoute),
    NotFound { reason: NotFoundReason },
}

impl RouteOutcome {
    pub fn not_found(reason: NotFoundReason) -> Self {
        RouteOutcome::NotFound { reason }
    }

    pub fn route(&self) -> Option<&Route> {
        match self {
            RouteOutcome::Found(planned) => Some(&planned.route),
            RouteOutcome::NotFound { .. } => None,
        }
    }
}

/// Path produced by a search stage, already smoothed.
#[derive(Debug, Clone)]
pub struct StagePath {
    pub coordinates: Vec<Coordinate>,
    pub nodes_visited: usize,
}

/// Validated request plus its buffered obstacles.
pub struct PreparedRoute {
    request: RouteRequest,
    config: RouteEngineConfig,
    obstacles: ObstacleSet,
}

impl PreparedRoute {
    pub fn prepare(request: &RouteRequest, config: &RouteEngineConfig) -> Result<Self, PlanError> {
        if !config.safety_epsilon_m.is_finite() || config.safety_epsilon_m < 0.0 {
            return Err(PlanError::InvalidTuning {
                name: "safety_epsilon_m",
                value: config.safety_epsilon_m,
            });
        }
        let request = request.validated()?;
        let config = config.with_request_overrides(&request);

        let mut anchors = vec![request.start, request.end];
        anchors.extend(request.no_fly_zones.iter().flat_map(|zone| zone.vertices().copied()));
        let frame = LocalFrame::centered_on(&anchors);
        let obstacles = ObstacleSet::build(
            frame,
            &request.no_fly_zones,
            request.corridor_width,
            config.safety_epsilon_m,
        );

        Ok(Self {
            request,
            config,
            obstacles,
        })
    }

    pub fn start(&self) -> Coordinate {
        self.request.start
    }

    pub fn end(&self) -> Coordinate {
        self.request.end
    }

    pub fn request(&self) -> &RouteRequest {
        &self.request
    }

    pub fn config(&self) -> &RouteEngineConfig {
        &self.config
    }

    pub fn obstacles(&self) -> &ObstacleSet {
        &self.obstacles
    }

    /// Distance of offset nodes from the zone boundary: the corridor width
    /// scaled by the offset factor, but always outside the buffer.
    pub fn offset_m(&self) -> f64 {
        self.config.offset_factor
            * self
                .request
                .corridor_width
                .max(self.obstacles.clearance_m())
    }

    /// Terrain mode from endpoint elevations. `None` means the ceiling is
    /// unknown and terrain is required, so nothing can be verified.
    pub fn terrain_mode(
        &self,
        start_elevation: Option<f64>,
        end_elevation: Option<f64>,
        terrain_required: bool,
    ) -> Option<TerrainMode> {
        match resolve_ceiling(
            start_elevation,
            end_elevation,
            self.config.elevation_margin_m,
            self.request.max_altitude,
        ) {
            Some(ceiling) => Some(TerrainMode::Ceiling(ceiling)),
            None if terrain_required => None,
            None => Some(TerrainMode::Ignore),
        }
    }

    pub fn terrain_policy<'a>(
        &self,
        lookup: &'a dyn ElevationLookup,
        mode: TerrainMode,
    ) -> TerrainPolicy<'a> {
        TerrainPolicy::new(lookup, mode, self.config.sample_spacing())
            .with_weights(self.config.elevation_weights())
    }

    pub fn direct_geometry_clear(&self) -> bool {
        !self.obstacles.coordinates_blocked(self.start(), self.end())
    }

    /// Straight segment passes both the zone and terrain tests.
    pub fn direct_clear(&self, policy: &TerrainPolicy<'_>) -> bool {
        self.direct_geometry_clear() && policy.segment_clear(self.start(), self.end())
    }

    /// Sample points the densifier may need on the direct leg.
    pub fn densify_samples(&self) -> Vec<Coordinate> {
        if !self.config.densify {
            return Vec::new();
        }
        bisection_points(self.start(), self.end(), self.config.densify_max_depth)
    }

    pub fn direct_route(&self, lookup: &dyn ElevationLookup) -> Vec<Coordinate> {
        let direct = [self.start(), self.end()];
        if !self.config.densify {
            return direct.to_vec();
        }
        densify_route(
            &direct,
            lookup,
            self.config.slope_threshold,
            self.config.densify_max_depth,
        )
    }

    pub fn visibility_graph(
        &self,
        deadline: Option<Instant>,
    ) -> Result<VisibilityGraph, DeadlineExceeded> {
        build_visibility_graph(
            self.start(),
            self.end(),
            &self.obstacles,
            self.offset_m(),
            deadline,
        )
    }

    /// Gate and cost the graph's edges by terrain, search it, smooth the result.
    pub fn search_visibility(
        &self,
        graph: &mut VisibilityGraph,
        policy: &TerrainPolicy<'_>,
        deadline: Option<Instant>,
    ) -> Result<StagePath, SearchFailure> {
        graph.apply_terrain(policy, deadline)?;
        let path = shortest_path(&*graph, START_NODE, END_NODE, Heuristic::Geodesic, deadline)?;
        Ok(self.smoothed(&*graph, &path.nodes, policy, path.nodes_visited))
    }

    /// Fallback lattice over start, end and every zone, padded by twice the
    /// corridor width (or offset distance, whichever is larger).
    pub fn grid_layout(&self, deadline: Option<Instant>) -> Result<GridLayout, DeadlineExceeded> {
        let pad = 2.0 * self.request.corridor_width.max(self.offset_m());
        GridLayout::build(
            self.start(),
            self.end(),
            &self.obstacles,
            &self.config.grid_settings(),
            pad,
            deadline,
        )
    }

    pub fn search_grid(
        &self,
        layout: &GridLayout,
        policy: &TerrainPolicy<'_>,
        deadline: Option<Instant>,
    ) -> Result<StagePath, SearchFailure> {
        let lattice = GridLattice::new(layout, &self.obstacles, policy);
        let path = shortest_path(
            &lattice,
            layout.start_node(),
            layout.goal_node(),
            Heuristic::Geodesic,
            deadline,
        )?;
        Ok(self.smoothed(&lattice, &path.nodes, policy, path.nodes_visited))
    }

    /// Shortcut a searched path. Shortcuts must clear zones and terrain.
    fn smoothed<G: SearchGraph + ?Sized>(
        &self,
        graph: &G,
        nodes: &[usize],
        policy: &TerrainPolicy<'_>,
        nodes_visited: usize,
    ) -> StagePath {
        let waypoints: Vec<Coordinate> = nodes.iter().map(|&id| graph.position(id)).collect();
        let coordinates = smooth_path(&waypoints, |a, b| {
            !self.obstacles.coordinates_blocked(*a, *b) && policy.segment_clear(*a, *b)
        });
        StagePath {
            coordinates,
            nodes_visited,
        }
    }

    pub fn finish(&self, coordinates: Vec<Coordinate>, stage: RouteStage, nodes_visited: usize) -> PlannedRoute {
        let corridor = buffer_route(&coordinates, self.obstacles.frame(), self.request.corridor_width);
        PlannedRoute {
            route: Route::from_coordinates(coordinates),
            stage,
            corridor,
            nodes_visited,
        }
    }

    /// Why every stage failed: missing elevation takes precedence, since a
    /// path may exist that simply could not be verified.
    pub fn failure_reason(&self, absent_samples: usize) -> NotFoundReason {
        if absent_samples > 0 {
            NotFoundReason::ElevationUnavailable
        } else {
            NotFoundReason::NoPathFound
        }
    }
}

/// Plan a route against already-resolved terrain.
///
/// `terrain_required = false` lets planning continue geometry-only when the
/// endpoint elevations are unavailable.
pub fn plan_route(
    request: &RouteRequest,
    config: &RouteEngineConfig,
    lookup: &dyn ElevationLookup,
    terrain_required: bool,
    deadline: Option<Instant>,
) -> Result<RouteOutcome, PlanError> {
    let plan = PreparedRoute::prepare(request, config)?;
    let Some(mode) = plan.terrain_mode(
        lookup.elevation_at(plan.start()),
        lookup.elevation_at(plan.end()),
        terrain_required,
    ) else {
        return Ok(RouteOutcome::not_found(NotFoundReason::ElevationUnavailable));
    };
    let policy = plan.terrain_policy(lookup, mode);

    if plan.direct_clear(&policy) {
        let coordinates = plan.direct_route(lookup);
        return Ok(RouteOutcome::Found(plan.finish(coordinates, RouteStage::Direct, 0)));
    }

    let Ok(mut graph) = plan.visibility_graph(deadline) else {
        return Ok(RouteOutcome::not_found(NotFoundReason::DeadlineExceeded));
    };
    let mut nodes_visited = 0;
    match plan.search_visibility(&mut graph, &policy, deadline) {
        Ok(path) => {
            return Ok(RouteOutcome::Found(plan.finish(
                path.coordinates,
                RouteStage::VisibilityGraph,
                path.nodes_visited,
            )));
        }
        Err(SearchFailure::DeadlineExceeded { .. }) => {
            return Ok(RouteOutcome::not_found(NotFoundReason::DeadlineExceeded));
        }
        Err(failure) => nodes_visited += failure.nodes_visited(),
    }

    let Ok(layout) = plan.grid_layout(deadline) else {
        return Ok(RouteOutcome::not_found(NotFoundReason::DeadlineExceeded));
    };
    match plan.search_grid(&layout, &policy, deadline) {
        Ok(path) => Ok(RouteOutcome::Found(plan.finish(
            path.coordinates,
            RouteStage::Grid,
            nodes_visited + path.nodes_visited,
        ))),
        Err(SearchFailure::DeadlineExceeded { .. }) => {
            Ok(RouteOutcome::not_found(NotFoundReason::DeadlineExceeded))
        }
        Err(SearchFailure::Disconnected { .. }) => {
            Ok(RouteOutcome::not_found(plan.failure_reason(policy.absent_samples())))
        }
    }
}
