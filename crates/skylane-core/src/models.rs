//! Core data models for corridor routing.

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::spatial::{haversine_distance, offset_by_bearing};

/// Latitudes are clamped just inside the poles.
pub const MAX_LATITUDE: f64 = 89.999_999;

/// WGS84 position, serialized in GeoJSON order as `[lon, lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Coordinate {
    pub lon: f64,
    pub lat: f64,
}

impl TryFrom<Vec<f64>> for Coordinate {
    type Error = String;

    /// Accepts GeoJSON positions; a trailing altitude is ignored.
    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [lon, lat, ..] => Ok(Self::new(*lon, *lat)),
            _ => Err(format!("position needs [lon, lat], got {} values", value.len())),
        }
    }
}

impl From<Coordinate> for [f64; 2] {
    fn from(value: Coordinate) -> Self {
        [value.lon, value.lat]
    }
}

impl Coordinate {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }

    /// Wrap longitude into (-180, 180] and clamp latitude inside the poles.
    pub fn normalized(self) -> Self {
        let mut lon = (self.lon + 180.0).rem_euclid(360.0) - 180.0;
        if lon <= -180.0 {
            lon += 360.0;
        }
        Self {
            lon,
            lat: self.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE),
        }
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        haversine_distance(self.lat, self.lon, other.lat, other.lon)
    }
}

/// Caller-supplied no-fly polygon. All rings share one even-odd fill, so
/// holes and multipolygon parts need no special casing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ZoneRepr")]
pub struct Zone {
    pub rings: Vec<Vec<Coordinate>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ZoneRepr {
    Feature { geometry: GeometryRepr },
    Geometry(GeometryRepr),
    Rings { rings: Vec<Vec<Coordinate>> },
    Bare(Vec<Vec<Coordinate>>),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum GeometryRepr {
    Polygon {
        coordinates: Vec<Vec<Coordinate>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Coordinate>>>,
    },
}

impl From<ZoneRepr> for Zone {
    fn from(value: ZoneRepr) -> Self {
        let rings = match value {
            ZoneRepr::Feature { geometry } | ZoneRepr::Geometry(geometry) => match geometry {
                GeometryRepr::Polygon { coordinates } => coordinates,
                GeometryRepr::MultiPolygon { coordinates } => {
                    coordinates.into_iter().flatten().collect()
                }
            },
            ZoneRepr::Rings { rings } | ZoneRepr::Bare(rings) => rings,
        };
        Zone::new(rings)
    }
}

impl Zone {
    /// Build a zone, dropping a duplicated closing vertex from each ring.
    pub fn new(rings: Vec<Vec<Coordinate>>) -> Self {
        let rings = rings
            .into_iter()
            .map(|mut ring| {
                if ring.len() > 1 && ring.first() == ring.last() {
                    ring.pop();
                }
                ring
            })
            .collect();
        Self { rings }
    }

    pub fn polygon(exterior: Vec<Coordinate>) -> Self {
        Self::new(vec![exterior])
    }

    /// Regular polygon approximating a circle of `radius_m` meters.
    pub fn circle(center: Coordinate, radius_m: f64, steps: usize) -> Self {
        let steps = steps.max(3);
        let ring = (0..steps)
            .map(|i| {
                let bearing = 2.0 * std::f64::consts::PI * i as f64 / steps as f64;
                let (lat, lon) = offset_by_bearing(center.lat, center.lon, radius_m, bearing);
                Coordinate::new(lon, lat)
            })
            .collect();
        Self::polygon(ring)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Coordinate> {
        self.rings.iter().flatten()
    }

    pub(crate) fn validate(&self, zone: usize) -> Result<(), PlanError> {
        if self.rings.is_empty() {
            return Err(PlanError::EmptyZone { zone });
        }
        if self.vertices().any(|c| !c.is_finite()) {
            return Err(PlanError::NonFiniteZone { zone });
        }
        for (ring, coords) in self.rings.iter().enumerate() {
            let mut distinct: Vec<&Coordinate> = Vec::with_capacity(coords.len());
            for coord in coords {
                if !distinct.contains(&coord) {
                    distinct.push(coord);
                }
            }
            if distinct.len() < 3 {
                return Err(PlanError::DegenerateRing {
                    zone,
                    ring,
                    vertices: distinct.len(),
                });
            }
        }
        Ok(())
    }
}

/// Where a graph node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeOrigin {
    Start,
    End,
    /// Offset waypoint next to `edge` of `ring` in buffered zone `zone`.
    ZoneOffset {
        zone: usize,
        ring: usize,
        edge: usize,
    },
    Lattice,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: usize,
    pub coordinate: Coordinate,
    pub origin: NodeOrigin,
}

/// Ordered polyline of at least two coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub coordinates: Vec<Coordinate>,
    pub length_m: f64,
}

impl Route {
    pub fn from_coordinates(coordinates: Vec<Coordinate>) -> Self {
        let length_m = coordinates
            .windows(2)
            .map(|pair| pair[0].distance_to(&pair[1]))
            .sum();
        Self {
            coordinates,
            length_m,
        }
    }
}

/// Route planning request as supplied by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub start: Coordinate,
    pub end: Coordinate,
    #[serde(default, alias = "noFlyZones", alias = "zones")]
    pub no_fly_zones: Vec<Zone>,
    #[serde(default, alias = "corridorWidth")]
    pub corridor_width: f64,
    /// Absolute ceiling in meters above sea level.
    #[serde(default, alias = "maxAltitude")]
    pub max_altitude: Option<f64>,
    #[serde(default, alias = "elevationMargin")]
    pub elevation_margin: Option<f64>,
    #[serde(default, alias = "slopeThreshold")]
    pub slope_threshold: Option<f64>,
    #[serde(default)]
    pub densify: Option<bool>,
    /// Charge climbs and credit descents on top of distance.
    #[serde(default, alias = "elevationWeighting")]
    pub elevation_weighting: Option<bool>,
    #[serde(default, alias = "deadlineMs")]
    pub deadline_ms: Option<u64>,
}

impl RouteRequest {
    pub fn new(start: Coordinate, end: Coordinate, no_fly_zones: Vec<Zone>, corridor_width: f64) -> Self {
        Self {
            start,
            end,
            no_fly_zones,
            corridor_width,
            max_altitude: None,
            elevation_margin: None,
            slope_threshold: None,
            densify: None,
            elevation_weighting: None,
            deadline_ms: None,
        }
    }

    /// Reject malformed input and return a copy with normalized endpoints.
    pub fn validated(&self) -> Result<RouteRequest, PlanError> {
        if !self.start.is_finite() {
            return Err(PlanError::NonFiniteCoordinate { which: "start" });
        }
        if !self.end.is_finite() {
            return Err(PlanError::NonFiniteCoordinate { which: "end" });
        }
        if !self.corridor_width.is_finite() || self.corridor_width < 0.0 {
            return Err(PlanError::InvalidCorridorWidth(self.corridor_width));
        }
        check_optional("max_altitude", self.max_altitude, false)?;
        check_optional("elevation_margin", self.elevation_margin, true)?;
        check_optional("slope_threshold", self.slope_threshold, true)?;
        for (idx, zone) in self.no_fly_zones.iter().enumerate() {
            zone.validate(idx)?;
        }

        let mut normalized = self.clone();
        normalized.start = self.start.normalized();
        normalized.end = self.end.normalized();
        if normalized.start == normalized.end {
            return Err(PlanError::DegenerateSegment);
        }
        Ok(normalized)
    }
}

fn check_optional(name: &'static str, value: Option<f64>, non_negative: bool) -> Result<(), PlanError> {
    match value {
        Some(v) if !v.is_finite() || (non_negative && v < 0.0) => {
            Err(PlanError::InvalidTuning { name, value: v })
        }
        _ => Ok(()),
    }
}
