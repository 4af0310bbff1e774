//! Async route planning over the shared elevation service.
//!
//! Runs the core's staged engine (direct check, visibility graph, grid
//! fallback) and prefetches the terrain each stage will sample before handing
//! the core a resolved snapshot. Graph construction and search are CPU-bound
//! and run on the blocking pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use skylane_core::{
    Coordinate, DeadlineClock, DeadlineExceeded, ElevationLookup, NotFoundReason, PlanError,
    PreparedRoute, RouteEngineConfig, RouteOutcome, RouteRequest, RouteStage, SearchFailure,
    StagePath, TerrainMode,
};
use tokio::time::Instant;

use crate::config::Config;
use crate::terrain::{ElevationService, ElevationSnapshot};
use crate::tiles::{tiles_along, TileKey};

#[derive(Clone)]
pub struct RouteEngine {
    elevation: ElevationService,
    config: RouteEngineConfig,
    terrain_required: bool,
    default_deadline: Duration,
}

impl RouteEngine {
    pub fn new(elevation: ElevationService, config: RouteEngineConfig) -> Self {
        Self {
            elevation,
            config,
            terrain_required: true,
            default_deadline: Duration::from_secs(30),
        }
    }

    pub fn from_config(elevation: ElevationService, config: &Config) -> Self {
        let engine_config = RouteEngineConfig {
            elevation_weighting: config.elevation_weighting,
            ..RouteEngineConfig::default()
        };
        Self::new(elevation, engine_config)
            .with_terrain_required(config.terrain_require)
            .with_default_deadline(Duration::from_secs(config.route_deadline_s))
    }

    pub fn with_terrain_required(mut self, required: bool) -> Self {
        self.terrain_required = required;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn elevation(&self) -> &ElevationService {
        &self.elevation
    }

    pub fn config(&self) -> &RouteEngineConfig {
        &self.config
    }

    /// Plan `request`. Only malformed input is an error; a missing route or
    /// missing terrain comes back as [`RouteOutcome::NotFound`].
    pub async fn plan(&self, request: &RouteRequest) -> Result<RouteOutcome, PlanError> {
        let started = Instant::now();
        let budget = request
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_deadline);
        let deadline = started + budget;

        let plan = Arc::new(PreparedRoute::prepare(request, &self.config)?);
        tracing::debug!(
            zones = plan.request().no_fly_zones.len(),
            corridor_width_m = plan.request().corridor_width,
            clearance_m = plan.obstacles().clearance_m(),
            "Planning route"
        );

        let outcome = self.run(plan, deadline).await;
        match &outcome {
            RouteOutcome::Found(planned) => tracing::info!(
                stage = ?planned.stage,
                points = planned.route.coordinates.len(),
                length_m = planned.route.length_m,
                nodes_visited = planned.nodes_visited,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Route planned"
            ),
            RouteOutcome::NotFound { reason } => tracing::info!(
                reason = ?reason,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "No route"
            ),
        }
        Ok(outcome)
    }

    async fn run(&self, plan: Arc<PreparedRoute>, deadline: Instant) -> RouteOutcome {
        let timed_out = RouteOutcome::not_found(NotFoundReason::DeadlineExceeded);
        let search_deadline = Some(deadline.into_std());
        let mut snapshot = self.elevation.snapshot();
        if !self.prefetch(&mut snapshot, [plan.start(), plan.end()], deadline).await {
            return timed_out;
        }

        let Some(mode) = plan.terrain_mode(
            snapshot.elevation_at(plan.start()),
            snapshot.elevation_at(plan.end()),
            self.terrain_required,
        ) else {
            tracing::warn!("Endpoint elevation unavailable, cannot verify terrain");
            return RouteOutcome::not_found(NotFoundReason::ElevationUnavailable);
        };
        let terrain_checked = matches!(mode, TerrainMode::Ceiling(_));
        match mode {
            TerrainMode::Ceiling(ceiling) => tracing::debug!(ceiling_m = ceiling, "Terrain ceiling"),
            TerrainMode::Ignore => tracing::warn!("Endpoint elevation unavailable, planning geometry-only"),
        }
        let zoom = snapshot.zoom();
        let mut absent_samples = 0;

        // Direct segment.
        if plan.direct_geometry_clear() {
            if terrain_checked {
                let samples = plan.config().sample_spacing().line_samples(plan.start(), plan.end());
                if !self.prefetch(&mut snapshot, samples, deadline).await {
                    return timed_out;
                }
            }
            let clear = {
                let policy = plan.terrain_policy(&snapshot, mode);
                let clear = policy.segment_clear(plan.start(), plan.end());
                absent_samples += policy.absent_samples();
                clear
            };

            if clear {
                if terrain_checked
                    && !self.prefetch(&mut snapshot, plan.densify_samples(), deadline).await
                {
                    return timed_out;
                }
                let coordinates = plan.direct_route(&snapshot);
                return RouteOutcome::Found(plan.finish(coordinates, RouteStage::Direct, 0));
            }
            tracing::debug!("Direct segment fails the terrain ceiling");
        } else {
            tracing::debug!("Direct segment crosses a buffered zone");
        }

        // Visibility graph.
        let stage = plan.clone();
        let built = offload(move || {
            let graph = stage.visibility_graph(search_deadline)?;
            let tiles = if terrain_checked {
                let mut clock = DeadlineClock::new(search_deadline);
                tiles_along(graph.segments(), &stage.config().sample_spacing(), zoom, &mut clock)?
            } else {
                HashSet::new()
            };
            Ok::<_, DeadlineExceeded>((graph, tiles))
        })
        .await;
        let Some(Ok((mut graph, tiles))) = built else {
            return timed_out;
        };
        tracing::debug!(
            nodes = graph.nodes().len(),
            edges = graph.edges().len(),
            tiles = tiles.len(),
            "Visibility graph built"
        );
        if !self.prefetch_tiles(&mut snapshot, tiles, deadline).await {
            return timed_out;
        }

        let stage = plan.clone();
        let searched = offload(move || {
            let (result, absent) = {
                let policy = stage.terrain_policy(&snapshot, mode);
                let result = stage.search_visibility(&mut graph, &policy, search_deadline);
                (result, policy.absent_samples())
            };
            (result, absent, snapshot)
        })
        .await;
        let Some((result, absent, returned)) = searched else {
            return timed_out;
        };
        snapshot = returned;
        absent_samples += absent;
        let mut nodes_visited = 0;
        match result {
            Ok(path) => return found(&plan, path, RouteStage::VisibilityGraph, 0),
            Err(SearchFailure::DeadlineExceeded { .. }) => return timed_out,
            Err(failure) => {
                nodes_visited += failure.nodes_visited();
                tracing::debug!(nodes_visited, "Visibility graph disconnected, trying grid");
            }
        }

        // Grid fallback.
        let stage = plan.clone();
        let built = offload(move || {
            let layout = stage.grid_layout(search_deadline)?;
            let tiles = if terrain_checked {
                let mut clock = DeadlineClock::new(search_deadline);
                tiles_along(layout.segments(), &stage.config().sample_spacing(), zoom, &mut clock)?
            } else {
                HashSet::new()
            };
            Ok::<_, DeadlineExceeded>((layout, tiles))
        })
        .await;
        let Some(Ok((layout, tiles))) = built else {
            return timed_out;
        };
        tracing::debug!(
            cell_m = layout.cell_m(),
            free = layout.free_count(),
            total = layout.lattice_len(),
            tiles = tiles.len(),
            "Grid lattice built"
        );
        if !self.prefetch_tiles(&mut snapshot, tiles, deadline).await {
            return timed_out;
        }

        let stage = plan.clone();
        let searched = offload(move || {
            let policy = stage.terrain_policy(&snapshot, mode);
            let result = stage.search_grid(&layout, &policy, search_deadline);
            (result, policy.absent_samples(), snapshot.missing_tiles())
        })
        .await;
        let Some((result, absent, missing_tiles)) = searched else {
            return timed_out;
        };
        absent_samples += absent;
        match result {
            Ok(path) => found(&plan, path, RouteStage::Grid, nodes_visited),
            Err(SearchFailure::DeadlineExceeded { .. }) => timed_out,
            Err(SearchFailure::Disconnected { .. }) => {
                if absent_samples > 0 {
                    tracing::warn!(
                        absent_samples,
                        missing_tiles,
                        "Terrain gaps blocked every candidate path"
                    );
                }
                RouteOutcome::not_found(plan.failure_reason(absent_samples))
            }
        }
    }

    async fn prefetch(
        &self,
        snapshot: &mut ElevationSnapshot,
        coords: impl IntoIterator<Item = Coordinate>,
        deadline: Instant,
    ) -> bool {
        self.elevation
            .prefetch_into(snapshot, coords, Some(deadline))
            .await
            && Instant::now() < deadline
    }

    async fn prefetch_tiles(
        &self,
        snapshot: &mut ElevationSnapshot,
        tiles: HashSet<TileKey>,
        deadline: Instant,
    ) -> bool {
        self.elevation
            .prefetch_tiles(snapshot, tiles, Some(deadline))
            .await
            && Instant::now() < deadline
    }
}

/// Run a planning stage on the blocking pool. `None` if the runtime
/// cancelled it; panics carry on into the caller.
async fn offload<T, F>(task: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => {
            tracing::warn!("Planning stage cancelled: {}", err);
            None
        }
    }
}

fn found(plan: &PreparedRoute, path: StagePath, stage: RouteStage, prior_visited: usize) -> RouteOutcome {
    RouteOutcome::Found(plan.finish(path.coordinates, stage, prior_visited + path.nodes_visited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::tests::{fast_config, FakeTiles};
    use crate::tiles::{TileFetchError, TileKey, TileRaster, TileSource};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use skylane_core::{GridLattice, LocalFrame, SearchGraph, TerrainPolicy, Zone};
    use std::cell::Cell;

    fn engine(source: Arc<dyn TileSource>) -> RouteEngine {
        RouteEngine::new(
            ElevationService::new(source, fast_config()),
            RouteEngineConfig::default(),
        )
    }

    fn flat_engine() -> RouteEngine {
        engine(Arc::new(FakeTiles::flat(50.0)))
    }

    /// Height grows 10 m per pixel eastward within each tile.
    struct RampTiles;

    impl TileSource for RampTiles {
        fn fetch(&self, _key: TileKey) -> BoxFuture<'static, Result<TileRaster, TileFetchError>> {
            let heights = (0..256 * 256).map(|idx| (idx % 256) as f32 * 10.0).collect();
            async move { TileRaster::from_heights(256, 256, heights) }.boxed()
        }
    }

    #[tokio::test]
    async fn no_zones_is_direct() {
        let request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.05, 0.05),
            vec![],
            10.0,
        );
        let outcome = flat_engine().plan(&request).await.unwrap();
        let RouteOutcome::Found(planned) = outcome else {
            panic!("expected a direct route");
        };
        assert_eq!(planned.stage, RouteStage::Direct);
        assert_eq!(planned.route.coordinates, vec![request.start, request.end]);
    }

    #[tokio::test]
    async fn routes_around_circle() {
        let zone = Zone::circle(Coordinate::new(1.0, 0.0), 0.5, 16);
        let request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(2.0, 0.0),
            vec![zone],
            0.0,
        );
        let outcome = flat_engine().plan(&request).await.unwrap();
        let route = outcome.route().expect("route around the circle");
        assert!(route.coordinates.len() >= 3);

        let prepared = PreparedRoute::prepare(&request, &RouteEngineConfig::default()).unwrap();
        for pair in route.coordinates.windows(2) {
            assert!(!prepared.obstacles().coordinates_blocked(pair[0], pair[1]));
        }
    }

    #[tokio::test]
    async fn enclosed_segment_is_not_found() {
        let start = Coordinate::new(0.0, 0.0);
        let end = Coordinate::new(1.0, 0.0);
        let frame = LocalFrame::centered_on(&[start, end]);
        let (a, b) = (frame.project(start), frame.project(end));
        let capsule = Zone::polygon(
            [(a.0 - 10.0, -10.0), (b.0 + 10.0, -10.0), (b.0 + 10.0, 10.0), (a.0 - 10.0, 10.0)]
                .into_iter()
                .map(|p| frame.unproject(p))
                .collect(),
        );
        let request = RouteRequest::new(start, end, vec![capsule], 0.0);
        let outcome = flat_engine().plan(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::NotFound {
                reason: NotFoundReason::NoPathFound
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_terrain_is_reported_or_relaxed() {
        let source = Arc::new(FakeTiles {
            fail_first: usize::MAX,
            ..FakeTiles::flat(0.0)
        });
        let request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.01, 0.0),
            vec![],
            10.0,
        );

        let strict = engine(source.clone());
        let outcome = strict.plan(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::NotFound {
                reason: NotFoundReason::ElevationUnavailable
            }
        ));

        let relaxed = engine(source).with_terrain_required(false);
        let outcome = relaxed.plan(&request).await.unwrap();
        assert_eq!(outcome.route().unwrap().coordinates.len(), 2);
    }

    #[tokio::test]
    async fn slow_terrain_hits_deadline() {
        let source = Arc::new(FakeTiles {
            delay: Duration::from_millis(300),
            ..FakeTiles::flat(0.0)
        });
        let mut request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.01, 0.0),
            vec![],
            10.0,
        );
        request.deadline_ms = Some(20);
        let outcome = engine(source).plan(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::NotFound {
                reason: NotFoundReason::DeadlineExceeded
            }
        ));
    }

    #[tokio::test]
    async fn steep_direct_leg_gains_vertices() {
        let request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.01, 0.0),
            vec![],
            0.0,
        );
        let outcome = engine(Arc::new(RampTiles)).plan(&request).await.unwrap();
        let RouteOutcome::Found(planned) = outcome else {
            panic!("expected a direct route");
        };
        assert_eq!(planned.stage, RouteStage::Direct);
        let coords = &planned.route.coordinates;
        assert!(coords.len() > 2);
        assert!(coords.windows(2).all(|pair| pair[0].lon < pair[1].lon));
        assert!(coords.iter().all(|c| c.lat == 0.0));
    }

    #[tokio::test]
    async fn invalid_request_is_an_error() {
        let request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(f64::NAN, 0.0),
            vec![],
            10.0,
        );
        assert!(flat_engine().plan(&request).await.is_err());
    }

    /// Walled yard whose only exit is a gap screened by a baffle: no straight
    /// line leaves it, but a lattice path can.
    fn baffled_yard() -> RouteRequest {
        let frame = LocalFrame::new(Coordinate::new(0.0, 0.0));
        let rect = |min: (f64, f64), max: (f64, f64)| {
            Zone::polygon(
                [min, (max.0, min.1), max, (min.0, max.1)]
                    .into_iter()
                    .map(|p| frame.unproject(p))
                    .collect(),
            )
        };
        let zones = vec![
            rect((-220.0, 100.0), (220.0, 120.0)),
            rect((-220.0, -120.0), (220.0, -100.0)),
            rect((-220.0, -120.0), (-200.0, 120.0)),
            rect((200.0, 20.0), (220.0, 120.0)),
            rect((200.0, -120.0), (220.0, -20.0)),
            rect((260.0, -80.0), (280.0, 80.0)),
        ];
        RouteRequest::new(frame.unproject((0.0, 0.0)), frame.unproject((600.0, 0.0)), zones, 2.0)
    }

    #[tokio::test]
    async fn disconnected_graph_falls_back_to_grid() {
        let config = RouteEngineConfig {
            offset_factor: 20.0,
            ..RouteEngineConfig::default()
        };
        let engine = RouteEngine::new(
            ElevationService::new(Arc::new(FakeTiles::flat(50.0)), fast_config()),
            config.clone(),
        );
        let request = baffled_yard();
        let outcome = engine.plan(&request).await.unwrap();
        let RouteOutcome::Found(planned) = outcome else {
            panic!("expected a lattice route");
        };
        assert_eq!(planned.stage, RouteStage::Grid);
        assert!(planned.route.coordinates.len() < 16);

        let prepared = PreparedRoute::prepare(&request, &config).unwrap();
        assert_eq!(planned.route.coordinates.first(), Some(&prepared.start()));
        assert_eq!(planned.route.coordinates.last(), Some(&prepared.end()));
        for pair in planned.route.coordinates.windows(2) {
            assert!(!prepared.obstacles().coordinates_blocked(pair[0], pair[1]));
        }
    }

    #[tokio::test]
    async fn deadline_cuts_graph_construction_short() {
        let zone = Zone::circle(Coordinate::new(0.05, 0.0), 2_000.0, 600);
        let mut request = RouteRequest::new(
            Coordinate::new(0.0, 0.0),
            Coordinate::new(0.1, 0.0),
            vec![zone],
            20.0,
        );
        request.deadline_ms = Some(50);
        let started = std::time::Instant::now();
        let outcome = flat_engine().plan(&request).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::NotFound {
                reason: NotFoundReason::DeadlineExceeded
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn grid_prefetch_covers_every_costed_link() {
        // Cells far wider than a z12 tile.
        let zone = Zone::circle(Coordinate::new(10.0, 60.0), 50_000.0, 24);
        let request = RouteRequest::new(
            Coordinate::new(0.0, 60.0),
            Coordinate::new(20.0, 60.0),
            vec![zone],
            50.0,
        );
        let prepared = PreparedRoute::prepare(&request, &RouteEngineConfig::default()).unwrap();
        let layout = prepared.grid_layout(None).unwrap();
        let spacing = prepared.config().sample_spacing();
        let mut clock = DeadlineClock::new(None);
        let tiles = tiles_along(layout.segments(), &spacing, 12, &mut clock).unwrap();

        let node_tiles: HashSet<TileKey> = (0..layout.goal_node())
            .filter_map(|id| TileKey::containing(layout.position(id), 12))
            .collect();
        assert!(tiles.len() > node_tiles.len());

        let unfetched = Cell::new(0usize);
        let lookup = |coord: Coordinate| {
            let key = TileKey::containing(coord, 12)?;
            if tiles.contains(&key) {
                Some(0.0)
            } else {
                unfetched.set(unfetched.get() + 1);
                None
            }
        };
        let policy = TerrainPolicy::new(&lookup, TerrainMode::Ceiling(1_000.0), spacing);
        let lattice = GridLattice::new(&layout, prepared.obstacles(), &policy);
        let mut neighbors = Vec::new();
        for id in 0..layout.goal_node() {
            lattice.neighbors(id, &mut neighbors);
        }
        assert!(!neighbors.is_empty());
        assert_eq!(unfetched.get(), 0);
    }

    #[test]
    fn weighting_follows_service_config() {
        let elevation = ElevationService::new(Arc::new(FakeTiles::flat(0.0)), fast_config());
        let engine = RouteEngine::from_config(elevation.clone(), &Config::default());
        assert!(!engine.config().elevation_weighting);

        let config = Config {
            elevation_weighting: true,
            ..Config::default()
        };
        let engine = RouteEngine::from_config(elevation, &config);
        assert!(engine.config().elevation_weighting);
    }
}
