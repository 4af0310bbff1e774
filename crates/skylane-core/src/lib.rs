pub mod densify;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod models;
pub mod route_engine;
pub mod search;
pub mod smoothing;
pub mod spatial;
pub mod terrain;
pub mod visibility;

pub use densify::{bisection_points, densify_adaptive, densify_route};
pub use error::{DeadlineExceeded, PlanError};
pub use geometry::{
    buffer_route, buffer_zone, offset_nodes, sample_along, segment_intersects_any, Bbox,
    BufferedZone, ObstacleSet, ZoneIndex,
};
pub use grid::{resolve_cell_size, GridLattice, GridLayout, GridSettings};
pub use models::{Coordinate, GraphNode, NodeOrigin, Route, RouteRequest, Zone};
pub use route_engine::{
    plan_route, NotFoundReason, PlannedRoute, PreparedRoute, RouteEngineConfig, RouteOutcome,
    RouteStage, StagePath,
};
pub use search::{
    shortest_path, DeadlineClock, Heuristic, SearchFailure, SearchGraph, SearchPath,
};
pub use smoothing::smooth_path;
pub use spatial::{haversine_distance, LocalFrame};
pub use terrain::{
    resolve_ceiling, ElevationLookup, ElevationWeights, SampleSpacing, TerrainMode, TerrainPolicy,
};
pub use visibility::{build_visibility_graph, Edge, VisibilityGraph, END_NODE, START_NODE};
