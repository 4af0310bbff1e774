//! Obstacle buffering, collision tests, line sampling and offset waypoints.
//!
//! A [`BufferedZone`] keeps the original rings in local meters together with
//! a clearance radius. Collision against it is exact for the Minkowski sum
//! of the filled polygon and a disk of that radius: a segment collides iff
//! its distance to the filled polygon is below the clearance.

use std::collections::HashSet;
use std::f64::consts::PI;

use rstar::{RTree, RTreeObject, AABB};

use crate::models::{Coordinate, GraphNode, NodeOrigin, Zone};
use crate::spatial::{
    add, cross, dot, length, point_in_rings, point_segment_distance, scale,
    segment_segment_distance, signed_area, sub, wrap_lon_delta, LocalFrame, Xy,
};

/// Angular resolution of arcs in display outlines.
const ARC_STEP_RAD: f64 = PI / 16.0;

/// Axis-aligned box in local meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min: Xy,
    pub max: Xy,
}

impl Bbox {
    pub fn around(point: Xy) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    pub fn from_points<I: IntoIterator<Item = Xy>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::around(first), Self::include))
    }

    pub fn include(self, point: Xy) -> Self {
        Self {
            min: (self.min.0.min(point.0), self.min.1.min(point.1)),
            max: (self.max.0.max(point.0), self.max.1.max(point.1)),
        }
    }

    pub fn union(self, other: Bbox) -> Self {
        self.include(other.min).include(other.max)
    }

    pub fn expanded(self, margin: f64) -> Self {
        Self {
            min: (self.min.0 - margin, self.min.1 - margin),
            max: (self.max.0 + margin, self.max.1 + margin),
        }
    }

    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min.0 <= other.max.0
            && other.min.0 <= self.max.0
            && self.min.1 <= other.max.1
            && other.min.1 <= self.max.1
    }

    pub fn width(&self) -> f64 {
        self.max.0 - self.min.0
    }

    pub fn height(&self) -> f64 {
        self.max.1 - self.min.1
    }

    fn to_aabb(self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min.0, self.min.1], [self.max.0, self.max.1])
    }
}

/// A zone expanded by a clearance radius, in local meters.
#[derive(Debug, Clone)]
pub struct BufferedZone {
    zone: usize,
    rings: Vec<Vec<Xy>>,
    holes: Vec<bool>,
    clearance_m: f64,
    bbox: Bbox,
}

impl BufferedZone {
    pub fn zone(&self) -> usize {
        self.zone
    }

    pub fn rings(&self) -> &[Vec<Xy>] {
        &self.rings
    }

    pub fn clearance_m(&self) -> f64 {
        self.clearance_m
    }

    /// Bounding box of the buffered shape (rings grown by the clearance).
    pub fn bbox(&self) -> Bbox {
        self.bbox
    }

    /// Distance from `point` to the filled polygon; zero inside it.
    pub fn distance_to_point(&self, point: Xy) -> f64 {
        if point_in_rings(point, &self.rings) {
            return 0.0;
        }
        self.edges()
            .map(|(a, b)| point_segment_distance(point, a, b))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn contains_point(&self, point: Xy) -> bool {
        self.is_too_close(self.distance_to_point(point))
    }

    pub fn intersects_segment(&self, a: Xy, b: Xy) -> bool {
        let seg_box = Bbox::around(a).include(b);
        if !self.bbox.intersects(&seg_box) {
            return false;
        }
        if point_in_rings(a, &self.rings) || point_in_rings(b, &self.rings) {
            return true;
        }
        self.edges()
            .any(|(p, q)| self.is_too_close(segment_segment_distance(a, b, p, q)))
    }

    /// Polygon approximation of the buffered shape for display, one ring per
    /// source ring (holes shrink instead of grow).
    pub fn outline(&self, frame: &LocalFrame) -> Vec<Vec<Coordinate>> {
        self.rings
            .iter()
            .zip(&self.holes)
            .map(|(ring, &hole)| {
                let ccw = signed_area(ring) > 0.0;
                let side = if ccw != hole { Side::Right } else { Side::Left };
                let mut outline: Vec<Coordinate> = offset_ring(ring, self.clearance_m, side)
                    .into_iter()
                    .map(|p| frame.unproject(p))
                    .collect();
                if let Some(first) = outline.first().copied() {
                    outline.push(first);
                }
                outline
            })
            .collect()
    }

    fn is_too_close(&self, distance: f64) -> bool {
        distance <= 0.0 || distance < self.clearance_m
    }

    fn edges(&self) -> impl Iterator<Item = (Xy, Xy)> + '_ {
        self.rings.iter().flat_map(|ring| {
            let n = ring.len();
            (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
        })
    }
}

/// Expand `zone` outward by half the corridor width plus `safety_epsilon_m`.
pub fn buffer_zone(
    zone_idx: usize,
    zone: &Zone,
    frame: &LocalFrame,
    corridor_width_m: f64,
    safety_epsilon_m: f64,
) -> BufferedZone {
    let clearance_m = corridor_width_m / 2.0 + safety_epsilon_m;
    let rings: Vec<Vec<Xy>> = zone
        .rings
        .iter()
        .map(|ring| ring.iter().map(|c| frame.project(*c)).collect())
        .collect();

    let holes = rings
        .iter()
        .enumerate()
        .map(|(idx, ring)| {
            let Some(&first) = ring.first() else {
                return false;
            };
            let enclosing = rings
                .iter()
                .enumerate()
                .filter(|(other, other_ring)| {
                    *other != idx && point_in_rings(first, std::slice::from_ref(*other_ring))
                })
                .count();
            enclosing % 2 == 1
        })
        .collect();

    let bbox = Bbox::from_points(rings.iter().flatten().copied())
        .unwrap_or(Bbox::around((0.0, 0.0)))
        .expanded(clearance_m);

    BufferedZone {
        zone: zone_idx,
        rings,
        holes,
        clearance_m,
        bbox,
    }
}

struct IndexedBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// R-tree over buffered zone bounding boxes for the collision pre-filter.
pub struct ZoneIndex {
    tree: RTree<IndexedBox>,
}

impl ZoneIndex {
    pub fn build(zones: &[BufferedZone]) -> Self {
        let boxes = zones
            .iter()
            .enumerate()
            .map(|(idx, zone)| IndexedBox {
                idx,
                env: zone.bbox().to_aabb(),
            })
            .collect();
        Self {
            tree: RTree::bulk_load(boxes),
        }
    }

    /// Indices of zones whose buffered bbox intersects `bbox`.
    pub fn candidates(&self, bbox: Bbox) -> impl Iterator<Item = usize> + '_ {
        self.tree
            .locate_in_envelope_intersecting(&bbox.to_aabb())
            .map(|entry| entry.idx)
    }
}

/// True when segment `a`-`b` comes within clearance of any buffered zone.
pub fn segment_intersects_any(a: Xy, b: Xy, zones: &[BufferedZone], index: &ZoneIndex) -> bool {
    let seg_box = Bbox::around(a).include(b);
    index
        .candidates(seg_box)
        .any(|idx| zones[idx].intersects_segment(a, b))
}

/// All buffered obstacles of one request, sharing a single local frame.
pub struct ObstacleSet {
    frame: LocalFrame,
    zones: Vec<BufferedZone>,
    index: ZoneIndex,
    corridor_width_m: f64,
    clearance_m: f64,
}

impl ObstacleSet {
    pub fn build(
        frame: LocalFrame,
        zones: &[Zone],
        corridor_width_m: f64,
        safety_epsilon_m: f64,
    ) -> Self {
        let zones: Vec<BufferedZone> = zones
            .iter()
            .enumerate()
            .map(|(idx, zone)| buffer_zone(idx, zone, &frame, corridor_width_m, safety_epsilon_m))
            .collect();
        let index = ZoneIndex::build(&zones);
        Self {
            frame,
            zones,
            index,
            corridor_width_m,
            clearance_m: corridor_width_m / 2.0 + safety_epsilon_m,
        }
    }

    pub fn frame(&self) -> &LocalFrame {
        &self.frame
    }

    pub fn zones(&self) -> &[BufferedZone] {
        &self.zones
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn corridor_width_m(&self) -> f64 {
        self.corridor_width_m
    }

    pub fn clearance_m(&self) -> f64 {
        self.clearance_m
    }

    /// Union of all buffered zone boxes.
    pub fn bbox(&self) -> Option<Bbox> {
        self.zones
            .iter()
            .map(BufferedZone::bbox)
            .reduce(Bbox::union)
    }

    pub fn segment_blocked(&self, a: Xy, b: Xy) -> bool {
        segment_intersects_any(a, b, &self.zones, &self.index)
    }

    pub fn coordinates_blocked(&self, a: Coordinate, b: Coordinate) -> bool {
        self.segment_blocked(self.frame.project(a), self.frame.project(b))
    }

    pub fn point_blocked(&self, point: Xy) -> bool {
        self.index
            .candidates(Bbox::around(point))
            .any(|idx| self.zones[idx].contains_point(point))
    }
}

/// Linear interpolation in degrees, unwrapping longitude across the antimeridian.
pub fn interpolate(a: Coordinate, b: Coordinate, t: f64) -> Coordinate {
    let dlon = wrap_lon_delta(b.lon - a.lon);
    Coordinate::new(a.lon + dlon * t, a.lat + (b.lat - a.lat) * t).normalized()
}

/// `n` equally spaced points from `a` to `b`, endpoints included.
pub fn sample_along(a: Coordinate, b: Coordinate, n: usize) -> Vec<Coordinate> {
    let n = n.max(2);
    let last = n - 1;
    (0..n)
        .map(|i| match i {
            0 => a,
            i if i == last => b,
            i => interpolate(a, b, i as f64 / last as f64),
        })
        .collect()
}

/// Candidate waypoints hugging the buffered zone.
///
/// For every ring edge, both endpoints are pushed out perpendicular to the
/// edge by `offset_m` on each side. Corners additionally get a miter point
/// where the two offset lines meet, so a path can round the corner without
/// cutting it. Points falling inside the zone's own buffer are dropped;
/// callers still have to filter against the other zones.
pub fn offset_nodes(zone: &BufferedZone, frame: &LocalFrame, offset_m: f64) -> Vec<GraphNode> {
    let mut points: Vec<(Xy, NodeOrigin)> = Vec::new();

    for (ring_idx, ring) in zone.rings().iter().enumerate() {
        let n = ring.len();
        if n < 2 {
            continue;
        }
        for i in 0..n {
            let p = ring[i];
            let q = ring[(i + 1) % n];
            let Some(dir) = unit(sub(q, p)) else {
                continue;
            };
            let origin = NodeOrigin::ZoneOffset {
                zone: zone.zone(),
                ring: ring_idx,
                edge: i,
            };
            let normal = left_normal(dir);
            for side in [1.0, -1.0] {
                let shift = scale(normal, side * offset_m);
                points.push((add(p, shift), origin));
                points.push((add(q, shift), origin));
            }

            // Miter at q between this edge and the next one.
            let r = ring[(i + 2) % n];
            let Some(next_dir) = unit(sub(r, q)) else {
                continue;
            };
            let next_normal = left_normal(next_dir);
            for side in [1.0, -1.0] {
                let Some(bisector) = unit(scale(add(normal, next_normal), side)) else {
                    continue;
                };
                let cos_half = dot(bisector, scale(normal, side));
                if cos_half > 0.3 && cos_half < 0.999 {
                    points.push((add(q, scale(bisector, offset_m / cos_half)), origin));
                }
            }
        }
    }

    let mut seen = HashSet::new();
    points
        .into_iter()
        .filter(|(p, _)| !zone.contains_point(*p))
        .filter(|(p, _)| seen.insert(((p.0 * 1000.0).round() as i64, (p.1 * 1000.0).round() as i64)))
        .enumerate()
        .map(|(id, (p, origin))| GraphNode {
            id,
            coordinate: frame.unproject(p),
            origin,
        })
        .collect()
}

/// Buffer a route polyline by half the corridor width on each side.
/// Returns a closed ring, or `None` for a zero-width corridor.
pub fn buffer_route(
    route: &[Coordinate],
    frame: &LocalFrame,
    corridor_width_m: f64,
) -> Option<Vec<Coordinate>> {
    let radius = corridor_width_m / 2.0;
    if radius <= 0.0 || !radius.is_finite() {
        return None;
    }
    let mut points: Vec<Xy> = Vec::with_capacity(route.len());
    for coord in route {
        let p = frame.project(*coord);
        if points.last().map_or(true, |last| length(sub(p, *last)) > 1e-9) {
            points.push(p);
        }
    }
    if points.len() < 2 {
        return None;
    }

    // Walk out along the route and back along its interior vertices; the
    // right-hand offset of that closed walk is the corridor outline.
    let mut walk = points.clone();
    walk.extend(points[1..points.len() - 1].iter().rev().copied());

    let mut ring: Vec<Coordinate> = offset_ring(&walk, radius, Side::Right)
        .into_iter()
        .map(|p| frame.unproject(p))
        .collect();
    if let Some(first) = ring.first().copied() {
        ring.push(first);
    }
    Some(ring)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

fn unit(v: Xy) -> Option<Xy> {
    let len = length(v);
    (len > 1e-9).then(|| scale(v, 1.0 / len))
}

fn left_normal(dir: Xy) -> Xy {
    (-dir.1, dir.0)
}

/// Offset a closed ring by `radius` on one side, with round joins on the
/// outside of each turn and mitered joins on the inside.
fn offset_ring(ring: &[Xy], radius: f64, side: Side) -> Vec<Xy> {
    let n = ring.len();
    if n < 2 || radius <= 0.0 {
        return ring.to_vec();
    }
    let sign = match side {
        Side::Left => 1.0,
        Side::Right => -1.0,
    };

    let mut out = Vec::with_capacity(n * 4);
    for i in 0..n {
        let prev = ring[(i + n - 1) % n];
        let v = ring[i];
        let next = ring[(i + 1) % n];
        let (Some(d_in), Some(d_out)) = (unit(sub(v, prev)), unit(sub(next, v))) else {
            continue;
        };
        let n_in = scale(left_normal(d_in), sign);
        let n_out = scale(left_normal(d_out), sign);
        let turn = cross(d_in, d_out);
        let along = dot(d_in, d_out);

        if turn.abs() < 1e-12 && along > 0.0 {
            out.push(add(v, scale(n_in, radius)));
            continue;
        }

        let reversal = turn.abs() < 1e-12 && along <= 0.0;
        if reversal || turn * sign < 0.0 {
            let start = n_in.1.atan2(n_in.0);
            let sweep = if reversal {
                -sign * PI
            } else {
                cross(n_in, n_out).atan2(dot(n_in, n_out))
            };
            let steps = (sweep.abs() / ARC_STEP_RAD).ceil().max(1.0) as usize;
            for k in 0..=steps {
                let angle = start + sweep * k as f64 / steps as f64;
                out.push(add(v, (radius * angle.cos(), radius * angle.sin())));
            }
        } else {
            match unit(add(n_in, n_out)) {
                Some(bisector) if dot(bisector, n_in) > 0.25 => {
                    out.push(add(v, scale(bisector, radius / dot(bisector, n_in))));
                }
                _ => {
                    out.push(add(v, scale(n_in, radius)));
                    out.push(add(v, scale(n_out, radius)));
                }
            }
        }
    }
    out
}
