//! Pure polygon and geometry utilities (C11): point-in-polygon, segment
//! intersection, area, convexity and self-intersection tests. No I/O, no
//! locking, fully deterministic — exercised directly by the behavior rule
//! engine and by the ROI validator.

use crate::error::{AnalyticsError, PolygonInvalidReason};

pub type Point = (f64, f64);

/// Minimum polygon area accepted by [`validate_polygon`], in px².
pub const DEFAULT_MIN_AREA: f64 = 100.0;

/// Even-odd (ray casting) point-in-polygon test. The polygon is treated as
/// implicitly closed (last vertex connects back to the first).
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let (px, py) = point;
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        let intersects = ((yi > py) != (yj > py))
            && (px < (xj - xi) * (py - yi) / (yj - yi) + xi);
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Orientation of the ordered triple (a,b,c): >0 counter-clockwise, <0
/// clockwise, 0 collinear.
fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    p.0 <= a.0.max(b.0)
        && p.0 >= a.0.min(b.0)
        && p.1 <= a.1.max(b.1)
        && p.1 >= a.1.min(b.1)
}

/// Strict segment intersection test: segments sharing only an adjacent
/// endpoint do not count as intersecting. Used both for line-cross rule
/// evaluation and for self-intersection validation of polygons.
pub fn segment_intersect(a: Point, b: Point, c: Point, d: Point) -> bool {
    // Segments that meet only at a shared endpoint (the adjacent-edge case
    // in a polygon walk) are not treated as crossing.
    if a == c || a == d || b == c || b == d {
        return false;
    }

    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);

    if (o1 > 0.0) != (o2 > 0.0) && (o3 > 0.0) != (o4 > 0.0) {
        return true;
    }

    if o1 == 0.0 && on_segment(a, b, c) {
        return true;
    }
    if o2 == 0.0 && on_segment(a, b, d) {
        return true;
    }
    if o3 == 0.0 && on_segment(c, d, a) {
        return true;
    }
    if o4 == 0.0 && on_segment(c, d, b) {
        return true;
    }
    false
}

/// Shoelace formula; always returns the absolute (unsigned) area.
pub fn polygon_area(polygon: &[Point]) -> f64 {
    let n = polygon.len();
    if n < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..n {
        let (x1, y1) = polygon[i];
        let (x2, y2) = polygon[(i + 1) % n];
        sum += x1 * y2 - x2 * y1;
    }
    (sum / 2.0).abs()
}

/// Sign-of-cross-products convexity test. Degenerate (<3 vertices)
/// polygons are not convex.
pub fn is_convex(polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        let c = polygon[(i + 2) % n];
        let cross = orientation(a, b, c);
        if cross.abs() < f64::EPSILON {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

/// Pairwise intersection test over every pair of non-adjacent edges.
pub fn is_self_intersecting(polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 4 {
        return false;
    }
    for i in 0..n {
        let a1 = polygon[i];
        let a2 = polygon[(i + 1) % n];
        for j in (i + 1)..n {
            // Adjacent edges (including the wrap-around pair) share an
            // endpoint by construction and are excluded.
            if j == i || j == (i + 1) % n {
                continue;
            }
            if i == 0 && j == n - 1 {
                continue;
            }
            let b1 = polygon[j];
            let b2 = polygon[(j + 1) % n];
            if segment_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}

/// Validates a polygon against every §4.6 condition, in the fixed order
/// the spec enumerates them, returning the first violated condition.
pub fn validate_polygon(
    polygon: &[Point],
    frame_width: f64,
    frame_height: f64,
    min_area: f64,
    require_convex: bool,
) -> Result<(), AnalyticsError> {
    if polygon.len() < 3 {
        return Err(AnalyticsError::PolygonInvalid {
            reason: PolygonInvalidReason::InsufficientPoints,
            area: 0.0,
        });
    }
    let out_of_range = polygon
        .iter()
        .any(|&(x, y)| x < 0.0 || y < 0.0 || x > frame_width || y > frame_height);
    if out_of_range {
        return Err(AnalyticsError::PolygonInvalid {
            reason: PolygonInvalidReason::CoordOutOfRange,
            area: polygon_area(polygon),
        });
    }
    let area = polygon_area(polygon);
    if area < min_area {
        return Err(AnalyticsError::PolygonInvalid {
            reason: PolygonInvalidReason::AreaTooSmall,
            area,
        });
    }
    if is_self_intersecting(polygon) {
        return Err(AnalyticsError::PolygonInvalid {
            reason: PolygonInvalidReason::SelfIntersection,
            area,
        });
    }
    if require_convex && !is_convex(polygon) {
        return Err(AnalyticsError::PolygonInvalid {
            reason: PolygonInvalidReason::NotConvex,
            area,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect() -> Vec<Point> {
        vec![(100.0, 100.0), (300.0, 100.0), (300.0, 300.0), (100.0, 300.0)]
    }

    #[test]
    fn point_in_polygon_inside_and_outside() {
        let r = rect();
        assert!(point_in_polygon((200.0, 200.0), &r));
        assert!(!point_in_polygon((50.0, 50.0), &r));
    }

    #[test]
    fn polygon_area_rect_is_exact() {
        assert_eq!(polygon_area(&rect()), 40000.0);
    }

    #[test]
    fn rect_is_convex() {
        assert!(is_convex(&rect()));
    }

    #[test]
    fn bowtie_is_self_intersecting() {
        let bowtie = vec![
            (100.0, 100.0),
            (200.0, 200.0),
            (200.0, 100.0),
            (100.0, 200.0),
        ];
        assert!(is_self_intersecting(&bowtie));
        assert!(!is_convex(&bowtie));
    }

    #[test]
    fn validate_polygon_rejects_self_intersection() {
        let bowtie = vec![
            (100.0, 100.0),
            (200.0, 200.0),
            (200.0, 100.0),
            (100.0, 200.0),
        ];
        let err = validate_polygon(&bowtie, 1920.0, 1080.0, DEFAULT_MIN_AREA, false).unwrap_err();
        match err {
            AnalyticsError::PolygonInvalid { reason, .. } => {
                assert_eq!(reason, PolygonInvalidReason::SelfIntersection)
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn validate_polygon_area_boundary() {
        // Triangle area = 0.5*base*height; tune just above/below min_area.
        let just_above = vec![(0.0, 0.0), (20.2, 0.0), (0.0, 10.0)];
        assert!(validate_polygon(&just_above, 1920.0, 1080.0, 100.0, false).is_ok());

        let just_below = vec![(0.0, 0.0), (19.8, 0.0), (0.0, 10.0)];
        let err = validate_polygon(&just_below, 1920.0, 1080.0, 100.0, false).unwrap_err();
        match err {
            AnalyticsError::PolygonInvalid { reason, .. } => {
                assert_eq!(reason, PolygonInvalidReason::AreaTooSmall)
            }
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn validate_polygon_idempotent() {
        let r = rect();
        let first = validate_polygon(&r, 1920.0, 1080.0, DEFAULT_MIN_AREA, false);
        let second = validate_polygon(&r, 1920.0, 1080.0, DEFAULT_MIN_AREA, false);
        assert_eq!(first.is_ok(), second.is_ok());
    }

    #[test]
    fn segment_intersect_excludes_adjacent_shared_endpoint() {
        // Two segments sharing endpoint (100,100) only, collinear-adjacent in a polygon walk.
        let a = (0.0, 100.0);
        let b = (100.0, 100.0);
        let c = (100.0, 100.0);
        let d = (200.0, 0.0);
        assert!(!segment_intersect(a, b, c, d));
    }

    #[test]
    fn segment_intersect_crossing() {
        let a = (0.0, 0.0);
        let b = (10.0, 10.0);
        let c = (0.0, 10.0);
        let d = (10.0, 0.0);
        assert!(segment_intersect(a, b, c, d));
    }
}
