//! Axis-aligned geographic rectangle
//!
//! `Extents` carries lon/lat (or planar) bounds in double precision. The
//! all-zero value doubles as the "empty" sentinel so an accumulator can be
//! grown with `expand` starting from `Extents::empty()`.

use std::cmp::Ordering;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Rectangular region bounded by minimum and maximum corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawExtents")]
pub struct Extents {
    minimum: DVec2,
    maximum: DVec2,
}

/// Unvalidated wire form; `TryFrom` funnels it through `Extents::new` so
/// deserialized bounds face the same checks as constructed ones.
#[derive(Deserialize)]
struct RawExtents {
    minimum: DVec2,
    maximum: DVec2,
}

impl TryFrom<RawExtents> for Extents {
    type Error = EngineError;

    fn try_from(raw: RawExtents) -> EngineResult<Self> {
        Extents::new(raw.minimum.x, raw.minimum.y, raw.maximum.x, raw.maximum.y)
    }
}

impl Extents {
    /// Create extents from corner coordinates.
    ///
    /// Fails with `InvalidExtents` when a bound is not finite or the
    /// minimum exceeds the maximum on either axis.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> EngineResult<Self> {
        let minimum = DVec2::new(min_x, min_y);
        let maximum = DVec2::new(max_x, max_y);
        if !minimum.is_finite() || !maximum.is_finite() {
            return Err(EngineError::invalid_extents(format!(
                "non-finite bound: ({}, {}) .. ({}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        if min_x > max_x || min_y > max_y {
            return Err(EngineError::invalid_extents(format!(
                "minimum exceeds maximum: ({}, {}) .. ({}, {})",
                min_x, min_y, max_x, max_y
            )));
        }
        Ok(Self { minimum, maximum })
    }

    /// The empty sentinel; `expand` treats it as "take the operand verbatim".
    pub fn empty() -> Self {
        Self {
            minimum: DVec2::ZERO,
            maximum: DVec2::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.minimum == DVec2::ZERO && self.maximum == DVec2::ZERO
    }

    pub fn minimum(&self) -> DVec2 {
        self.minimum
    }

    pub fn maximum(&self) -> DVec2 {
        self.maximum
    }

    pub fn center(&self) -> DVec2 {
        (self.minimum + self.maximum) * 0.5
    }

    pub fn size(&self) -> DVec2 {
        self.maximum - self.minimum
    }

    /// Boundary points count as contained.
    pub fn contains(&self, point: DVec2) -> bool {
        point.x >= self.minimum.x
            && point.x <= self.maximum.x
            && point.y >= self.minimum.y
            && point.y <= self.maximum.y
    }

    /// Inclusive overlap test; extents that merely share an edge intersect.
    pub fn intersects(&self, other: &Extents) -> bool {
        self.minimum.x.max(other.minimum.x) <= self.maximum.x.min(other.maximum.x)
            && self.minimum.y.max(other.minimum.y) <= self.maximum.y.min(other.maximum.y)
    }

    /// Grow to cover `point`. An empty accumulator takes the point as both
    /// corners.
    pub fn expand_point(&mut self, point: DVec2) {
        if self.is_empty() {
            self.minimum = point;
            self.maximum = point;
        } else {
            self.minimum = self.minimum.min(point);
            self.maximum = self.maximum.max(point);
        }
    }

    /// Grow to cover `other`. An empty accumulator takes `other` verbatim.
    pub fn expand(&mut self, other: &Extents) {
        if self.is_empty() {
            *self = *other;
        } else {
            self.minimum = self.minimum.min(other.minimum);
            self.maximum = self.maximum.max(other.maximum);
        }
    }

    /// Quadrant children at the midpoint, ordered lower-left, lower-right,
    /// upper-left, upper-right. Together they partition `self` exactly.
    pub fn split(&self) -> [Extents; 4] {
        let mid = self.center();
        let lower_left = Extents {
            minimum: self.minimum,
            maximum: mid,
        };
        let lower_right = Extents {
            minimum: DVec2::new(mid.x, self.minimum.y),
            maximum: DVec2::new(self.maximum.x, mid.y),
        };
        let upper_left = Extents {
            minimum: DVec2::new(self.minimum.x, mid.y),
            maximum: DVec2::new(mid.x, self.maximum.y),
        };
        let upper_right = Extents {
            minimum: mid,
            maximum: self.maximum,
        };
        [lower_left, lower_right, upper_left, upper_right]
    }
}

impl Eq for Extents {}

/// Lexicographic order over (minimum, maximum) so extents can key a BTreeMap.
impl Ord for Extents {
    fn cmp(&self, other: &Self) -> Ordering {
        self.minimum
            .x
            .total_cmp(&other.minimum.x)
            .then_with(|| self.minimum.y.total_cmp(&other.minimum.y))
            .then_with(|| self.maximum.x.total_cmp(&other.maximum.x))
            .then_with(|| self.maximum.y.total_cmp(&other.maximum.y))
    }
}

impl PartialOrd for Extents {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
