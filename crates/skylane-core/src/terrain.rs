//! Terrain gating and elevation-weighted edge costs.
//!
//! The core never fetches anything: elevation comes in through
//! [`ElevationLookup`], typically a snapshot of prefetched tiles.

use std::cell::Cell;

use crate::geometry::sample_along;
use crate::models::Coordinate;

/// Synchronous elevation source. `None` means the sample is unavailable and
/// must never be read as sea level.
pub trait ElevationLookup {
    fn elevation_at(&self, coord: Coordinate) -> Option<f64>;
}

impl<F> ElevationLookup for F
where
    F: Fn(Coordinate) -> Option<f64>,
{
    fn elevation_at(&self, coord: Coordinate) -> Option<f64> {
        self(coord)
    }
}

/// Ceiling = highest endpoint elevation plus margin, capped by `max_altitude`.
/// `None` when either endpoint elevation is unavailable.
pub fn resolve_ceiling(
    start_elevation: Option<f64>,
    end_elevation: Option<f64>,
    margin_m: f64,
    max_altitude: Option<f64>,
) -> Option<f64> {
    let ceiling = start_elevation?.max(end_elevation?) + margin_m;
    Some(match max_altitude {
        Some(limit) => ceiling.min(limit),
        None => ceiling,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerrainMode {
    /// Geometry-only planning; terrain is not consulted.
    Ignore,
    /// Every sample must be present and at or below the ceiling.
    Ceiling(f64),
}

/// How densely segments are sampled for elevation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSpacing {
    pub step_m: f64,
    pub min_samples: usize,
    pub max_samples: usize,
}

impl SampleSpacing {
    /// Sample count for a segment of `distance_m`, at least `floor`.
    pub fn count(&self, distance_m: f64, floor: usize) -> usize {
        let by_step = (distance_m / self.step_m.max(1.0)).ceil() as usize + 1;
        by_step.max(floor).max(2).min(self.max_samples.max(2))
    }

    /// Sample points for `a`-`b` at the configured minimum.
    pub fn line_samples(&self, a: Coordinate, b: Coordinate) -> Vec<Coordinate> {
        sample_along(a, b, self.count(a.distance_to(&b), self.min_samples))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElevationWeights {
    /// Meters of cost added per meter climbed.
    pub climb_penalty: f64,
    /// Meters of cost removed per meter descended.
    pub descent_credit: f64,
}

impl ElevationWeights {
    fn cost(&self, distance_m: f64, ascent_m: f64, descent_m: f64) -> f64 {
        (distance_m + self.climb_penalty * ascent_m - self.descent_credit * descent_m).max(distance_m)
    }
}

/// Terrain rules for one request.
pub struct TerrainPolicy<'a> {
    lookup: &'a dyn ElevationLookup,
    mode: TerrainMode,
    spacing: SampleSpacing,
    weights: Option<ElevationWeights>,
    absent_samples: Cell<usize>,
}

impl<'a> TerrainPolicy<'a> {
    pub fn new(lookup: &'a dyn ElevationLookup, mode: TerrainMode, spacing: SampleSpacing) -> Self {
        Self {
            lookup,
            mode,
            spacing,
            weights: None,
            absent_samples: Cell::new(0),
        }
    }

    pub fn with_weights(mut self, weights: Option<ElevationWeights>) -> Self {
        self.weights = weights;
        self
    }

    pub fn mode(&self) -> TerrainMode {
        self.mode
    }

    pub fn lookup(&self) -> &'a dyn ElevationLookup {
        self.lookup
    }

    pub fn spacing(&self) -> &SampleSpacing {
        &self.spacing
    }

    /// Number of unavailable samples seen so far while gating.
    pub fn absent_samples(&self) -> usize {
        self.absent_samples.get()
    }

    /// Points sampled by [`Self::segment_clear`] and [`Self::edge_cost`].
    pub fn line_samples(&self, a: Coordinate, b: Coordinate) -> Vec<Coordinate> {
        self.spacing.line_samples(a, b)
    }

    /// True when every sample of `a`-`b` is known and under the ceiling.
    pub fn segment_clear(&self, a: Coordinate, b: Coordinate) -> bool {
        let TerrainMode::Ceiling(ceiling) = self.mode else {
            return true;
        };
        self.line_samples(a, b)
            .into_iter()
            .all(|point| self.sample_below(point, ceiling))
    }

    /// Cost of flying `a`-`b`, or `None` if terrain blocks it.
    ///
    /// Never below the geodesic length, so A* with a geodesic heuristic
    /// stays admissible under weighting.
    pub fn edge_cost(&self, a: Coordinate, b: Coordinate) -> Option<f64> {
        self.edge_costs(a, b).map(|(forward, _)| forward)
    }

    /// Costs of `a`->`b` and `b`->`a` from one pass over the samples.
    /// Climbing one way is descending the other, so the two differ once
    /// weighting is on.
    pub fn edge_costs(&self, a: Coordinate, b: Coordinate) -> Option<(f64, f64)> {
        let distance = a.distance_to(&b);
        let TerrainMode::Ceiling(ceiling) = self.mode else {
            return Some((distance, distance));
        };

        let samples = self.line_samples(a, b);
        let mut heights = Vec::with_capacity(samples.len());
        for point in samples {
            let height = self.record(self.lookup.elevation_at(point))?;
            if height > ceiling {
                return None;
            }
            heights.push(height);
        }

        let Some(weights) = self.weights else {
            return Some((distance, distance));
        };
        let (ascent, descent) = heights.windows(2).fold((0.0, 0.0), |(up, down), pair| {
            let delta = pair[1] - pair[0];
            if delta > 0.0 {
                (up + delta, down)
            } else {
                (up, down - delta)
            }
        });
        Some((
            weights.cost(distance, ascent, descent),
            weights.cost(distance, descent, ascent),
        ))
    }

    fn sample_below(&self, point: Coordinate, ceiling: f64) -> bool {
        self.record(self.lookup.elevation_at(point))
            .is_some_and(|height| height <= ceiling)
    }

    fn record(&self, sample: Option<f64>) -> Option<f64> {
        if sample.is_none() {
            self.absent_samples.set(self.absent_samples.get() + 1);
        }
        sample
    }
}
