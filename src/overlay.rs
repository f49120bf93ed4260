//! Per-pair overlay computation
//!
//! [`OverlayComputer`] is the only place geometry is touched. Implementations must
//! be pure: no I/O, no state carried between calls, safe to call concurrently for
//! different pairs. A pair that cannot be computed resolves to "no result" through
//! [`PairComputationError`]; an empty or degenerate overlay is `Ok(None)`.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{
    Area, BooleanOps, CoordsIter, EuclideanLength, Geometry, Intersects, Line, LineString,
    MultiLineString, MultiPoint, MultiPolygon, Point,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::SubmissionError;

/// Areas and lengths at or below this are treated as empty
pub const DEGENERATE_EPSILON: f64 = 1e-12;

/// Binary overlay operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Area/length shared by target and mask
    Intersection,
    /// Target minus mask (erase)
    Difference,
}

impl Operation {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intersection => "intersection",
            Self::Difference => "difference",
        }
    }

    /// Human label used when naming result items
    pub fn label(&self) -> &'static str {
        match self {
            Self::Intersection => "Intersection",
            Self::Difference => "Erase",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SubmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intersection" | "intersect" => Ok(Self::Intersection),
            "difference" | "erase" => Ok(Self::Difference),
            other => Err(SubmissionError::UnsupportedOperation(other.to_string())),
        }
    }
}

/// Why one pair produced no result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PairComputationError {
    /// Structurally broken input (empty parts, short rings, non-finite coordinates)
    #[error("invalid geometry: {reason}")]
    InvalidGeometry {
        /// What is broken
        reason: String,
    },

    /// A ring or line crosses itself
    #[error("self-intersecting geometry")]
    SelfIntersection,

    /// Geometry kind the overlay does not handle
    #[error("unsupported geometry kind: {0}")]
    UnsupportedGeometry(&'static str),

    /// The geometry library panicked on this pair
    #[error("overlay panicked: {0}")]
    Panicked(String),
}

/// Computes the overlay of one target geometry with one mask geometry.
///
/// A panic escaping `compute` is treated by the worker pool as a worker crash
/// (the whole batch fails and is retried), not as a pair failure.
pub trait OverlayComputer: Send + Sync + 'static {
    /// `Ok(Some(_))` for a non-empty result, `Ok(None)` for an empty or degenerate one
    fn compute(
        &self,
        target: &Geometry<f64>,
        mask: &Geometry<f64>,
        operation: Operation,
    ) -> Result<Option<Geometry<f64>>, PairComputationError>;
}

impl<F> OverlayComputer for F
where
    F: Fn(&Geometry<f64>, &Geometry<f64>, Operation) -> Result<Option<Geometry<f64>>, PairComputationError>
        + Send
        + Sync
        + 'static,
{
    fn compute(
        &self,
        target: &Geometry<f64>,
        mask: &Geometry<f64>,
        operation: Operation,
    ) -> Result<Option<Geometry<f64>>, PairComputationError> {
        self(target, mask, operation)
    }
}

/// Default computer backed by `geo` boolean operations and line clipping
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryOverlay;

impl GeometryOverlay {
    /// New computer
    pub fn new() -> Self {
        Self
    }
}

impl OverlayComputer for GeometryOverlay {
    fn compute(
        &self,
        target: &Geometry<f64>,
        mask: &Geometry<f64>,
        operation: Operation,
    ) -> Result<Option<Geometry<f64>>, PairComputationError> {
        let target = Shape::validated(target)?;
        let mask = Shape::validated(mask)?;

        // Intersection is bounded by the lower-dimensional input, difference by the target.
        let required_dimension = match operation {
            Operation::Intersection => target.dimension().min(mask.dimension()),
            Operation::Difference => target.dimension(),
        };

        let shape = panic::catch_unwind(AssertUnwindSafe(|| overlay_shapes(&target, &mask, operation)))
            .map_err(|payload| PairComputationError::Panicked(panic_message(payload.as_ref())))?;

        Ok(shape.and_then(|shape| shape.into_geometry(required_dimension)))
    }
}

/// Geometry normalised into one of the three dimensional families
#[derive(Debug, Clone)]
enum Shape {
    Puntal(MultiPoint<f64>),
    Lineal(MultiLineString<f64>),
    Areal(MultiPolygon<f64>),
}

impl Shape {
    fn validated(geometry: &Geometry<f64>) -> Result<Self, PairComputationError> {
        if geometry
            .coords_iter()
            .any(|c| !c.x.is_finite() || !c.y.is_finite())
        {
            return Err(invalid("non-finite coordinate"));
        }

        let shape = Self::from_geometry(geometry)?;
        shape.check_topology()?;
        Ok(shape)
    }

    fn from_geometry(geometry: &Geometry<f64>) -> Result<Self, PairComputationError> {
        match geometry {
            Geometry::Point(p) => Ok(Self::Puntal(MultiPoint::new(vec![*p]))),
            Geometry::MultiPoint(mp) => Ok(Self::Puntal(mp.clone())),
            Geometry::Line(l) => Ok(Self::Lineal(MultiLineString::new(vec![LineString::from(
                vec![l.start, l.end],
            )]))),
            Geometry::LineString(ls) => Ok(Self::Lineal(MultiLineString::new(vec![ls.clone()]))),
            Geometry::MultiLineString(mls) => Ok(Self::Lineal(mls.clone())),
            Geometry::Polygon(p) => Ok(Self::Areal(MultiPolygon::new(vec![p.clone()]))),
            Geometry::MultiPolygon(mp) => Ok(Self::Areal(mp.clone())),
            Geometry::Rect(r) => Ok(Self::Areal(MultiPolygon::new(vec![r.to_polygon()]))),
            Geometry::Triangle(t) => Ok(Self::Areal(MultiPolygon::new(vec![t.to_polygon()]))),
            Geometry::GeometryCollection(_) => {
                Err(PairComputationError::UnsupportedGeometry("GeometryCollection"))
            }
        }
    }

    fn dimension(&self) -> u8 {
        match self {
            Self::Puntal(_) => 0,
            Self::Lineal(_) => 1,
            Self::Areal(_) => 2,
        }
    }

    fn check_topology(&self) -> Result<(), PairComputationError> {
        match self {
            Self::Puntal(mp) => {
                if mp.0.is_empty() {
                    return Err(invalid("empty point set"));
                }
            }
            Self::Lineal(mls) => {
                if mls.0.is_empty() {
                    return Err(invalid("empty line set"));
                }
                for ls in &mls.0 {
                    if ls.0.len() < 2 {
                        return Err(invalid("line with fewer than two positions"));
                    }
                    if has_self_intersection(ls) {
                        return Err(PairComputationError::SelfIntersection);
                    }
                }
            }
            Self::Areal(mp) => {
                if mp.0.is_empty() {
                    return Err(invalid("empty polygon set"));
                }
                for polygon in &mp.0 {
                    for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                        if ring.0.len() < 4 {
                            return Err(invalid("ring with fewer than four positions"));
                        }
                        if has_self_intersection(ring) {
                            return Err(PairComputationError::SelfIntersection);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn intersects_point(&self, point: &Point<f64>) -> bool {
        match self {
            Self::Puntal(mp) => mp.iter().any(|p| p == point),
            Self::Lineal(mls) => mls.intersects(point),
            Self::Areal(mp) => mp.intersects(point),
        }
    }

    fn into_geometry(self, required_dimension: u8) -> Option<Geometry<f64>> {
        if self.dimension() < required_dimension {
            return None;
        }

        match self {
            Self::Puntal(mut mp) => match mp.0.len() {
                0 => None,
                1 => mp.0.pop().map(Geometry::Point),
                _ => Some(Geometry::MultiPoint(mp)),
            },
            Self::Lineal(mut mls) => {
                mls.0.retain(|ls| ls.euclidean_length() > DEGENERATE_EPSILON);
                match mls.0.len() {
                    0 => None,
                    1 => mls.0.pop().map(Geometry::LineString),
                    _ => Some(Geometry::MultiLineString(mls)),
                }
            }
            Self::Areal(mut mp) => {
                mp.0.retain(|p| p.unsigned_area() > DEGENERATE_EPSILON);
                match mp.0.len() {
                    0 => None,
                    1 => mp.0.pop().map(Geometry::Polygon),
                    _ => Some(Geometry::MultiPolygon(mp)),
                }
            }
        }
    }
}

fn overlay_shapes(target: &Shape, mask: &Shape, operation: Operation) -> Option<Shape> {
    use Operation::{Difference, Intersection};
    use Shape::{Areal, Lineal, Puntal};

    match (operation, target, mask) {
        (Intersection, Areal(a), Areal(b)) => Some(Areal(a.intersection(b))),
        (Intersection, Lineal(l), Areal(p)) | (Intersection, Areal(p), Lineal(l)) => {
            Some(Lineal(p.clip(l, false)))
        }
        (Intersection, Puntal(points), other) | (Intersection, other, Puntal(points)) => {
            Some(Puntal(filter_points(points, other, true)))
        }
        // Only collinear runs count; crossing points fall below the inputs' dimension.
        (Intersection, Lineal(a), Lineal(b)) => Some(Lineal(shared_segments(a, b))),
        (Difference, Areal(a), Areal(b)) => Some(Areal(a.difference(b))),
        (Difference, Lineal(l), Areal(p)) => Some(Lineal(p.clip(l, true))),
        (Difference, Puntal(points), other) => Some(Puntal(filter_points(points, other, false))),
        // A lower-dimensional mask removes nothing measurable from the target.
        (Difference, unchanged, _) => Some(unchanged.clone()),
    }
}

/// Collinear overlaps between segments of `a` and segments of `b`
fn shared_segments(a: &MultiLineString<f64>, b: &MultiLineString<f64>) -> MultiLineString<f64> {
    let mut shared = Vec::new();
    for left in a.iter().flat_map(|ls| ls.lines()) {
        for right in b.iter().flat_map(|ls| ls.lines()) {
            if let Some(LineIntersection::Collinear { intersection }) = line_intersection(left, right) {
                shared.push(LineString::new(vec![intersection.start, intersection.end]));
            }
        }
    }
    MultiLineString::new(shared)
}

fn filter_points(points: &MultiPoint<f64>, other: &Shape, keep_touching: bool) -> MultiPoint<f64> {
    MultiPoint::new(
        points
            .iter()
            .filter(|p| other.intersects_point(p) == keep_touching)
            .copied()
            .collect(),
    )
}

/// True if two non-adjacent segments of the line touch, or adjacent ones overlap
fn has_self_intersection(line: &LineString<f64>) -> bool {
    let segments: Vec<Line<f64>> = line.lines().filter(|l| l.start != l.end).collect();
    let count = segments.len();
    let closed = line.is_closed();

    for i in 0..count {
        for j in (i + 1)..count {
            let adjacent = j == i + 1 || (closed && i == 0 && j == count - 1);
            match line_intersection(segments[i], segments[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return true,
            }
        }
    }
    false
}

fn invalid(reason: &str) -> PairComputationError {
    PairComputationError::InvalidGeometry {
        reason: reason.to_string(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon};

    fn square(x: f64, y: f64, size: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
        ])
    }

    fn area(geometry: &Geometry<f64>) -> f64 {
        geometry.unsigned_area()
    }

    fn length(geometry: &Geometry<f64>) -> f64 {
        match geometry {
            Geometry::LineString(ls) => ls.euclidean_length(),
            Geometry::MultiLineString(mls) => mls.euclidean_length(),
            _ => 0.0,
        }
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("intersection".parse::<Operation>().unwrap(), Operation::Intersection);
        assert_eq!("Erase".parse::<Operation>().unwrap(), Operation::Difference);
        assert!(matches!(
            "union".parse::<Operation>(),
            Err(SubmissionError::UnsupportedOperation(op)) if op == "union"
        ));
    }

    #[test]
    fn test_overlapping_squares_intersect() {
        let result = GeometryOverlay
            .compute(&square(0.0, 0.0, 2.0), &square(1.0, 1.0, 2.0), Operation::Intersection)
            .unwrap()
            .expect("overlap should produce a result");
        assert!((area(&result) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_intersection_is_none() {
        let result = GeometryOverlay
            .compute(&square(0.0, 0.0, 1.0), &square(5.0, 5.0, 1.0), Operation::Intersection)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_edge_touching_squares_are_degenerate() {
        let result = GeometryOverlay
            .compute(&square(0.0, 0.0, 1.0), &square(1.0, 0.0, 1.0), Operation::Intersection)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_fully_covered_difference_is_none() {
        let result = GeometryOverlay
            .compute(&square(0.0, 0.0, 1.0), &square(-1.0, -1.0, 3.0), Operation::Difference)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_partial_difference_keeps_remainder() {
        let result = GeometryOverlay
            .compute(&square(0.0, 0.0, 2.0), &square(1.0, 0.0, 2.0), Operation::Difference)
            .unwrap()
            .expect("half of the target should remain");
        assert!((area(&result) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_clipped_by_polygon() {
        let line = Geometry::LineString(line_string![(x: -1.0, y: 0.5), (x: 2.0, y: 0.5)]);
        let mask = square(0.0, 0.0, 1.0);

        let inside = GeometryOverlay
            .compute(&line, &mask, Operation::Intersection)
            .unwrap()
            .expect("line crosses the square");
        assert!((length(&inside) - 1.0).abs() < 1e-9);

        let outside = GeometryOverlay
            .compute(&line, &mask, Operation::Difference)
            .unwrap()
            .expect("line extends past the square");
        assert!((length(&outside) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_points_filtered_by_mask() {
        let points = Geometry::MultiPoint(MultiPoint::new(vec![
            point!(x: 0.5, y: 0.5),
            point!(x: 5.0, y: 5.0),
        ]));
        let mask = square(0.0, 0.0, 1.0);

        let inside = GeometryOverlay
            .compute(&points, &mask, Operation::Intersection)
            .unwrap();
        assert_eq!(inside, Some(Geometry::Point(point!(x: 0.5, y: 0.5))));

        let outside = GeometryOverlay
            .compute(&points, &mask, Operation::Difference)
            .unwrap();
        assert_eq!(outside, Some(Geometry::Point(point!(x: 5.0, y: 5.0))));
    }

    #[test]
    fn test_crossing_lines_are_degenerate() {
        let a = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
        let b = Geometry::LineString(line_string![(x: 0.0, y: 1.0), (x: 1.0, y: 0.0)]);
        assert_eq!(GeometryOverlay.compute(&a, &b, Operation::Intersection), Ok(None));
    }

    #[test]
    fn test_collinear_lines_share_their_overlap() {
        let a = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0)]);
        let b = Geometry::LineString(line_string![(x: 1.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 1.0)]);
        let shared = GeometryOverlay
            .compute(&a, &b, Operation::Intersection)
            .unwrap()
            .expect("lines overlap on [1, 2]");
        match shared {
            Geometry::LineString(line) => assert!((line.euclidean_length() - 1.0).abs() < 1e-9),
            other => panic!("expected a single segment, got {other:?}"),
        }
    }

    #[test]
    fn test_collinear_lines_touching_at_an_end_are_degenerate() {
        let a = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)]);
        let b = Geometry::LineString(line_string![(x: 1.0, y: 0.0), (x: 2.0, y: 0.0)]);
        assert_eq!(GeometryOverlay.compute(&a, &b, Operation::Intersection), Ok(None));
    }

    #[test]
    fn test_line_mask_leaves_polygon_unchanged() {
        let target = square(0.0, 0.0, 1.0);
        let mask = Geometry::LineString(line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
        let result = GeometryOverlay
            .compute(&target, &mask, Operation::Difference)
            .unwrap()
            .expect("target survives");
        assert!((area(&result) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bowtie_is_rejected() {
        let bowtie = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 1.0, y: 0.0),
            (x: 0.0, y: 1.0),
        ]);
        assert_eq!(
            GeometryOverlay.compute(&bowtie, &square(0.0, 0.0, 1.0), Operation::Intersection),
            Err(PairComputationError::SelfIntersection)
        );
    }

    #[test]
    fn test_non_finite_and_collections_are_rejected() {
        let nan = Geometry::Point(point!(x: f64::NAN, y: 0.0));
        assert!(matches!(
            GeometryOverlay.compute(&nan, &square(0.0, 0.0, 1.0), Operation::Intersection),
            Err(PairComputationError::InvalidGeometry { .. })
        ));

        let collection = Geometry::GeometryCollection(geo::GeometryCollection(vec![]));
        assert_eq!(
            GeometryOverlay.compute(&collection, &square(0.0, 0.0, 1.0), Operation::Intersection),
            Err(PairComputationError::UnsupportedGeometry("GeometryCollection"))
        );
    }

    #[test]
    fn test_closures_are_computers() {
        let never = |_: &Geometry<f64>,
                     _: &Geometry<f64>,
                     _: Operation|
         -> Result<Option<Geometry<f64>>, PairComputationError> { Ok(None) };
        assert_eq!(
            never.compute(&square(0.0, 0.0, 1.0), &square(0.0, 0.0, 1.0), Operation::Intersection),
            Ok(None)
        );
    }
}
