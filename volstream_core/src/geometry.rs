//! Plain geometric primitives used by visibility and size estimation.
//!
//! Bounding boxes carry their 8 corners explicitly, frustums are 6 plane
//! equations. Nothing here knows about cameras or scene graphs; the viewer
//! module builds frustums from its own matrices.

use nalgebra::{Matrix4, Point3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Normal lengths below this are treated as degenerate planes.
const MIN_NORMAL_LENGTH: f64 = 1e-12;

// ============================================================================
// PLANE
// ============================================================================

/// Plane `normal · p + d = 0`, with the inside half-space where the value is ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vector3<f64>,
    pub d: f64,
}

impl Plane {
    /// Builds a normalized plane from homogeneous coefficients `(a, b, c, d)`.
    pub fn from_coefficients(coeffs: Vector4<f64>) -> Self {
        let normal = Vector3::new(coeffs.x, coeffs.y, coeffs.z);
        let len = normal.norm().max(MIN_NORMAL_LENGTH);
        Self {
            normal: normal / len,
            d: coeffs.w / len,
        }
    }

    /// Builds a plane through `point` facing `normal`.
    pub fn from_point_normal(point: &Point3<f64>, normal: &Vector3<f64>) -> Self {
        let n = normal.normalize();
        Self {
            normal: n,
            d: -n.dot(&point.coords),
        }
    }

    /// Signed distance of a point; positive on the inside.
    pub fn signed_distance(&self, point: &Point3<f64>) -> f64 {
        self.normal.dot(&point.coords) + self.d
    }

    pub fn contains(&self, point: &Point3<f64>) -> bool {
        self.signed_distance(point) >= 0.0
    }
}

// ============================================================================
// FRUSTUM
// ============================================================================

/// Six inward-facing planes: left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extracts the frustum planes from a view-projection matrix
    /// (OpenGL clip convention, z in [-w, w]).
    pub fn from_view_projection(vp: &Matrix4<f64>) -> Self {
        let r0 = vp.row(0).transpose();
        let r1 = vp.row(1).transpose();
        let r2 = vp.row(2).transpose();
        let r3 = vp.row(3).transpose();

        Self {
            planes: [
                Plane::from_coefficients(r3 + r0),
                Plane::from_coefficients(r3 - r0),
                Plane::from_coefficients(r3 + r1),
                Plane::from_coefficients(r3 - r1),
                Plane::from_coefficients(r3 + r2),
                Plane::from_coefficients(r3 - r2),
            ],
        }
    }

    /// True if the point is on the inside of all six planes.
    pub fn contains_point(&self, point: &Point3<f64>) -> bool {
        self.planes.iter().all(|plane| plane.contains(point))
    }

    /// True if at least one corner is inside all six planes.
    ///
    /// Partially visible boxes count as visible; a box that straddles the
    /// frustum with every corner outside does not.
    pub fn contains_any_corner(&self, corners: &[Point3<f64>; 8]) -> bool {
        corners.iter().any(|corner| self.contains_point(corner))
    }
}

// ============================================================================
// BOUNDING BOX
// ============================================================================

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl BoundingBox {
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Builds a box around `center`; negative extents are mirrored.
    pub fn from_center_extents(center: Point3<f64>, half_extents: Vector3<f64>) -> Self {
        let half = half_extents.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    pub fn size(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// The 8 corners, bottom face first.
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (min, max) = (self.min, self.max);
        [
            Point3::new(min.x, min.y, min.z),
            Point3::new(max.x, min.y, min.z),
            Point3::new(min.x, max.y, min.z),
            Point3::new(max.x, max.y, min.z),
            Point3::new(min.x, min.y, max.z),
            Point3::new(max.x, min.y, max.z),
            Point3::new(min.x, max.y, max.z),
            Point3::new(max.x, max.y, max.z),
        ]
    }
}

// ============================================================================
// SCREEN RECT
// ============================================================================

/// Pixel-space rectangle enclosing a projected shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl ScreenRect {
    /// Smallest rectangle enclosing all points, `None` for an empty set.
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut rect: Option<Self> = None;
        for (x, y) in points {
            rect = Some(match rect {
                None => Self {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
                Some(r) => Self {
                    min_x: r.min_x.min(x),
                    min_y: r.min_y.min(y),
                    max_x: r.max_x.max(x),
                    max_y: r.max_y.max(y),
                },
            });
        }
        rect
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }
}

/// Cosine similarity of two directions; zero vectors give 0.
pub fn direction_similarity(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    match (a.try_normalize(MIN_NORMAL_LENGTH), b.try_normalize(MIN_NORMAL_LENGTH)) {
        (Some(a), Some(b)) => a.dot(&b),
        _ => 0.0,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Perspective3};

    fn looking_down_negative_z() -> Frustum {
        let view = Isometry3::look_at_rh(
            &Point3::origin(),
            &Point3::new(0.0, 0.0, -1.0),
            &Vector3::y(),
        );
        let proj = Perspective3::new(16.0 / 9.0, 60f64.to_radians(), 0.3, 100.0);
        Frustum::from_view_projection(&(proj.to_homogeneous() * view.to_homogeneous()))
    }

    #[test]
    fn test_plane_signed_distance() {
        let plane = Plane::from_point_normal(&Point3::new(0.0, 0.0, 2.0), &Vector3::new(0.0, 0.0, 3.0));
        assert_relative_eq!(plane.signed_distance(&Point3::new(5.0, 1.0, 4.0)), 2.0);
        assert!(!plane.contains(&Point3::origin()));
    }

    #[test]
    fn test_frustum_contains_point_in_front() {
        let frustum = looking_down_negative_z();
        assert!(frustum.contains_point(&Point3::new(0.0, 0.0, -10.0)));
        assert!(!frustum.contains_point(&Point3::new(0.0, 0.0, 10.0)));
        assert!(!frustum.contains_point(&Point3::new(0.0, 0.0, -200.0)));
        assert!(!frustum.contains_point(&Point3::new(500.0, 0.0, -10.0)));
    }

    #[test]
    fn test_frustum_planes_are_normalized() {
        let frustum = looking_down_negative_z();
        for plane in &frustum.planes {
            assert_relative_eq!(plane.normal.norm(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_partially_visible_box_counts() {
        let frustum = looking_down_negative_z();
        // Straddles the near plane: the far corners are inside.
        let bbox = BoundingBox::from_center_extents(Point3::new(0.0, 0.0, 0.0), Vector3::new(0.5, 0.5, 5.0));
        assert!(frustum.contains_any_corner(&bbox.corners()));
    }

    #[test]
    fn test_box_behind_camera_not_visible() {
        let frustum = looking_down_negative_z();
        let bbox = BoundingBox::from_center_extents(Point3::new(0.0, 0.0, 20.0), Vector3::new(1.0, 1.0, 1.0));
        assert!(!frustum.contains_any_corner(&bbox.corners()));
    }

    #[test]
    fn test_bounding_box_corners() {
        let bbox = BoundingBox::from_center_extents(Point3::new(1.0, 2.0, 3.0), Vector3::new(-1.0, 1.0, 2.0));
        let corners = bbox.corners();
        assert_eq!(corners[0], Point3::new(0.0, 1.0, 1.0));
        assert_eq!(corners[7], Point3::new(2.0, 3.0, 5.0));
        assert_eq!(bbox.center(), Point3::new(1.0, 2.0, 3.0));
        assert_eq!(bbox.size(), Vector3::new(2.0, 2.0, 4.0));
    }

    #[test]
    fn test_bounding_box_union() {
        let a = BoundingBox::new(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0));
        let b = BoundingBox::new(Point3::new(-2.0, 0.5, 0.5), Point3::new(0.5, 3.0, 0.7));
        let u = a.union(&b);
        assert_eq!(u.min, Point3::new(-2.0, 0.0, 0.0));
        assert_eq!(u.max, Point3::new(1.0, 3.0, 1.0));
    }

    #[test]
    fn test_screen_rect_enclosing() {
        assert!(ScreenRect::enclosing(Vec::<(f64, f64)>::new()).is_none());
        let rect = ScreenRect::enclosing(vec![(10.0, 5.0), (2.0, 30.0), (7.0, 7.0)]).unwrap();
        assert_relative_eq!(rect.width(), 8.0);
        assert_relative_eq!(rect.height(), 25.0);
        assert_relative_eq!(rect.area(), 200.0);
    }

    #[test]
    fn test_direction_similarity() {
        let x = Vector3::new(2.0, 0.0, 0.0);
        assert_relative_eq!(direction_similarity(&x, &Vector3::new(5.0, 0.0, 0.0)), 1.0);
        assert_relative_eq!(direction_similarity(&x, &Vector3::new(-1.0, 0.0, 0.0)), -1.0);
        assert_eq!(direction_similarity(&x, &Vector3::zeros()), 0.0);
    }
}
