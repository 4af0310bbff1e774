//! Spatial math: geodesic distances, a local metric frame, and planar
//! segment/polygon primitives used by the obstacle tests.

use crate::models::Coordinate;

/// Planar point in meters (east, north) relative to a [`LocalFrame`] origin.
pub type Xy = (f64, f64);

/// Mean Earth radius used by the Haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Calculate distance between two points in meters using Haversine formula.
///
/// # Arguments
/// * `lat1`, `lon1` - First point coordinates in decimal degrees
/// * `lat2`, `lon2` - Second point coordinates in decimal degrees
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Meters per degree of latitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lat(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_132.954 - 559.822 * (2.0 * lat_rad).cos() + 1.175 * (4.0 * lat_rad).cos()
        - 0.0023 * (6.0 * lat_rad).cos()
}

/// Meters per degree of longitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lon(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_412.84 * lat_rad.cos() - 93.5 * (3.0 * lat_rad).cos() + 0.118 * (5.0 * lat_rad).cos()
}

/// Offset a position by distance and bearing.
///
/// # Returns
/// (new_lat, new_lon) in degrees
pub fn offset_by_bearing(lat: f64, lon: f64, distance_m: f64, bearing_rad: f64) -> (f64, f64) {
    if distance_m.abs() <= f64::EPSILON {
        return (lat, lon);
    }

    let lat1 = lat.to_radians();
    let lon1 = lon.to_radians();
    let angular_distance = distance_m / EARTH_RADIUS_M;

    let sin_lat1 = lat1.sin();
    let cos_lat1 = lat1.cos();
    let sin_ad = angular_distance.sin();
    let cos_ad = angular_distance.cos();

    let sin_lat2 = sin_lat1 * cos_ad + cos_lat1 * sin_ad * bearing_rad.cos();
    let lat2 = sin_lat2.clamp(-1.0, 1.0).asin();

    let y = bearing_rad.sin() * sin_ad * cos_lat1;
    let x = cos_ad - sin_lat1 * sin_lat2;
    let mut lon2 = lon1 + y.atan2(x);
    lon2 =
        (lon2 + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI) - std::f64::consts::PI;

    (lat2.to_degrees(), lon2.to_degrees())
}

/// Wrap a longitude difference into [-180, 180).
pub fn wrap_lon_delta(delta_deg: f64) -> f64 {
    (delta_deg + 180.0).rem_euclid(360.0) - 180.0
}

/// Equirectangular projection around a fixed origin.
///
/// Every geometric test of one request runs in the same frame so that
/// obstacle buffers, graph nodes and collision checks agree exactly.
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    origin: Coordinate,
    meters_lat: f64,
    meters_lon: f64,
}

impl LocalFrame {
    pub fn new(origin: Coordinate) -> Self {
        Self {
            origin,
            meters_lat: meters_per_deg_lat(origin.lat).max(1e-9),
            meters_lon: meters_per_deg_lon(origin.lat).max(1.0),
        }
    }

    /// Frame centered on the mean of the given coordinates. Longitudes are
    /// averaged as offsets from the first one so the antimeridian is handled.
    pub fn centered_on<'a, I>(coords: I) -> Self
    where
        I: IntoIterator<Item = &'a Coordinate>,
    {
        let mut iter = coords.into_iter();
        let Some(first) = iter.next().copied() else {
            return Self::new(Coordinate::new(0.0, 0.0));
        };
        let mut sum_lat = first.lat;
        let mut sum_dlon = 0.0;
        let mut count = 1.0;
        for coord in iter {
            sum_lat += coord.lat;
            sum_dlon += wrap_lon_delta(coord.lon - first.lon);
            count += 1.0;
        }
        let origin = Coordinate::new(first.lon + sum_dlon / count, sum_lat / count).normalized();
        Self::new(origin)
    }

    pub fn origin(&self) -> Coordinate {
        self.origin
    }

    pub fn project(&self, coord: Coordinate) -> Xy {
        (
            wrap_lon_delta(coord.lon - self.origin.lon) * self.meters_lon,
            (coord.lat - self.origin.lat) * self.meters_lat,
        )
    }

    pub fn unproject(&self, point: Xy) -> Coordinate {
        Coordinate::new(
            self.origin.lon + point.0 / self.meters_lon,
            self.origin.lat + point.1 / self.meters_lat,
        )
        .normalized()
    }
}

pub(crate) fn sub(a: Xy, b: Xy) -> Xy {
    (a.0 - b.0, a.1 - b.1)
}

pub(crate) fn add(a: Xy, b: Xy) -> Xy {
    (a.0 + b.0, a.1 + b.1)
}

pub(crate) fn scale(a: Xy, k: f64) -> Xy {
    (a.0 * k, a.1 * k)
}

pub(crate) fn dot(a: Xy, b: Xy) -> f64 {
    a.0 * b.0 + a.1 * b.1
}

pub(crate) fn cross(a: Xy, b: Xy) -> f64 {
    a.0 * b.1 - a.1 * b.0
}

pub(crate) fn length(a: Xy) -> f64 {
    dot(a, a).sqrt()
}

pub fn segments_intersect_2d(a1: Xy, a2: Xy, b1: Xy, b2: Xy) -> bool {
    // Tolerance in meters for projection and arithmetic error.
    const EPS_M: f64 = 1e-6;

    fn orient(p: Xy, q: Xy, r: Xy) -> f64 {
        (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
    }

    fn within(a: f64, b: f64, value: f64) -> bool {
        let min = a.min(b) - EPS_M;
        let max = a.max(b) + EPS_M;
        value >= min && value <= max
    }

    fn on_segment(p: Xy, q: Xy, r: Xy) -> bool {
        within(p.0, q.0, r.0) && within(p.1, q.1, r.1)
    }

    let o1 = orient(a1, a2, b1);
    let o2 = orient(a1, a2, b2);
    let o3 = orient(b1, b2, a1);
    let o4 = orient(b1, b2, a2);

    if o1.abs() <= EPS_M && on_segment(a1, a2, b1) {
        return true;
    }
    if o2.abs() <= EPS_M && on_segment(a1, a2, b2) {
        return true;
    }
    if o3.abs() <= EPS_M && on_segment(b1, b2, a1) {
        return true;
    }
    if o4.abs() <= EPS_M && on_segment(b1, b2, a2) {
        return true;
    }

    let a_crosses = (o1 > EPS_M && o2 < -EPS_M) || (o1 < -EPS_M && o2 > EPS_M);
    let b_crosses = (o3 > EPS_M && o4 < -EPS_M) || (o3 < -EPS_M && o4 > EPS_M);
    a_crosses && b_crosses
}

/// Minimum distance from a point to a segment, all in local meters.
pub fn point_segment_distance(point: Xy, seg_start: Xy, seg_end: Xy) -> f64 {
    let (px, py) = sub(point, seg_start);
    let (sx, sy) = sub(seg_end, seg_start);
    let seg_len_sq = sx * sx + sy * sy;

    if seg_len_sq < 1e-12 {
        // Segment is essentially a point
        return (px * px + py * py).sqrt();
    }

    // Project point onto segment line: t = ((P-A) · (B-A)) / |B-A|²
    let t = ((px * sx + py * sy) / seg_len_sq).clamp(0.0, 1.0);
    let dx = px - t * sx;
    let dy = py - t * sy;
    (dx * dx + dy * dy).sqrt()
}

/// Minimum distance between two segments; zero when they touch or cross.
pub fn segment_segment_distance(a1: Xy, a2: Xy, b1: Xy, b2: Xy) -> f64 {
    if segments_intersect_2d(a1, a2, b1, b2) {
        return 0.0;
    }
    let d1 = point_segment_distance(a1, b1, b2);
    let d2 = point_segment_distance(a2, b1, b2);
    let d3 = point_segment_distance(b1, a1, a2);
    let d4 = point_segment_distance(b2, a1, a2);
    d1.min(d2).min(d3).min(d4)
}

/// Even-odd containment test over every ring (holes and multipolygon parts
/// fall out of the parity rule).
pub fn point_in_rings(point: Xy, rings: &[Vec<Xy>]) -> bool {
    let (x, y) = point;
    let mut inside = false;
    for ring in rings {
        let n = ring.len();
        if n < 3 {
            continue;
        }
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = ring[i];
            let (xj, yj) = ring[j];
            if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
                inside = !inside;
            }
            j = i;
        }
    }
    inside
}

/// Signed shoelace area; positive for counter-clockwise rings.
pub fn signed_area(ring: &[Xy]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let (x1, y1) = ring[i];
        let (x2, y2) = ring[(i + 1) % n];
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}
