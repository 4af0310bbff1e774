use thiserror::Error;

/// Precondition violations detected before any search runs.
///
/// "No route" and "no elevation" are not errors; they come back as
/// [`crate::RouteOutcome::NotFound`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("{which} coordinate is not finite")]
    NonFiniteCoordinate { which: &'static str },

    #[error("start and end coordinates are identical")]
    DegenerateSegment,

    #[error("corridor width must be finite and non-negative (got {0})")]
    InvalidCorridorWidth(f64),

    #[error("zone {zone} ring {ring} has {vertices} distinct vertices, need at least 3")]
    DegenerateRing {
        zone: usize,
        ring: usize,
        vertices: usize,
    },

    #[error("zone {zone} has no rings")]
    EmptyZone { zone: usize },

    #[error("zone {zone} contains a non-finite vertex")]
    NonFiniteZone { zone: usize },

    #[error("invalid {name}: {value}")]
    InvalidTuning { name: &'static str, value: f64 },
}

/// Planning ran past the caller's deadline before a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("planning deadline exceeded")]
pub struct DeadlineExceeded;
