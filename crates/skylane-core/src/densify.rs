//! Adaptive densification of accepted straight legs.
//!
//! A leg is split at its midpoint while the terrain slope between its ends
//! exceeds the threshold, so steep legs gain vertices and flat ones stay long.

use crate::geometry::interpolate;
use crate::models::Coordinate;
use crate::terrain::ElevationLookup;

fn midpoint(a: Coordinate, b: Coordinate) -> Coordinate {
    interpolate(a, b, 0.5)
}

/// Densify every leg of `route`. Endpoints and existing vertices are kept.
pub fn densify_route(
    route: &[Coordinate],
    lookup: &dyn ElevationLookup,
    slope_threshold: f64,
    max_depth: u32,
) -> Vec<Coordinate> {
    let Some(&last) = route.last() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(route.len());
    for leg in route.windows(2) {
        densify_adaptive(leg[0], leg[1], lookup, slope_threshold, max_depth, 0, &mut out);
    }
    out.push(last);
    out
}

/// Push `a` and any inserted midpoints of `a`-`b` (not `b` itself).
///
/// An unavailable elevation at either end stops the split: there is no
/// slope to measure.
pub fn densify_adaptive(
    a: Coordinate,
    b: Coordinate,
    lookup: &dyn ElevationLookup,
    slope_threshold: f64,
    max_depth: u32,
    depth: u32,
    out: &mut Vec<Coordinate>,
) {
    let steep = match (lookup.elevation_at(a), lookup.elevation_at(b)) {
        (Some(ha), Some(hb)) => {
            let horizontal = a.distance_to(&b);
            horizontal > 1e-6 && (ha - hb).abs() / horizontal > slope_threshold
        }
        _ => false,
    };

    if !steep || depth >= max_depth {
        out.push(a);
        return;
    }

    let mid = midpoint(a, b);
    densify_adaptive(a, mid, lookup, slope_threshold, max_depth, depth + 1, out);
    densify_adaptive(mid, b, lookup, slope_threshold, max_depth, depth + 1, out);
}

/// Every point [`densify_adaptive`] could sample on `a`-`b` down to
/// `max_depth`, for prefetching. Yields `2^max_depth + 1` points.
pub fn bisection_points(a: Coordinate, b: Coordinate, max_depth: u32) -> Vec<Coordinate> {
    fn collect(a: Coordinate, b: Coordinate, depth: u32, max_depth: u32, out: &mut Vec<Coordinate>) {
        if depth >= max_depth {
            out.push(a);
            return;
        }
        let mid = midpoint(a, b);
        collect(a, mid, depth + 1, max_depth, out);
        collect(mid, b, depth + 1, max_depth, out);
    }

    let mut out = Vec::with_capacity((1usize << max_depth.min(20)) + 1);
    collect(a, b, 0, max_depth, &mut out);
    out.push(b);
    out
}
