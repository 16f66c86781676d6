//! Per-viewer camera state and projection helpers.

use crate::geometry::Frustum;
use nalgebra::{Isometry3, Matrix4, Perspective3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use volstream_env::{ProjectionParams, ViewerId, ViewerUpdate};

/// Clip-space w below which a point counts as behind the camera.
const MIN_CLIP_W: f64 = 1e-9;

/// Camera of one connected viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerState {
    pub id: ViewerId,
    pub position: Point3<f64>,

    /// Unit view direction
    pub forward: Vector3<f64>,

    /// Unit up vector, orthogonal to `forward`
    pub up: Vector3<f64>,

    pub projection: ProjectionParams,

    /// Planes derived from the current pose and projection
    pub frustum: Frustum,
}

impl ViewerState {
    pub fn new(
        id: ViewerId,
        position: Point3<f64>,
        forward: Vector3<f64>,
        up: Vector3<f64>,
        projection: ProjectionParams,
    ) -> Self {
        let (forward, up) = orthonormal_basis(forward, up);
        let projection = sanitize_projection(projection);
        let frustum = Frustum::from_view_projection(&view_projection(&position, &forward, &up, &projection));
        Self {
            id,
            position,
            forward,
            up,
            projection,
            frustum,
        }
    }

    pub fn from_update(update: &ViewerUpdate) -> Self {
        Self::new(
            update.id,
            Point3::from(update.position),
            Vector3::from(update.forward),
            Vector3::from(update.up),
            update.projection,
        )
    }

    /// Replaces the pose and projection, rebuilding the frustum.
    pub fn apply_update(&mut self, update: &ViewerUpdate) {
        *self = Self::from_update(update);
    }

    pub fn view_matrix(&self) -> Matrix4<f64> {
        view_matrix(&self.position, &self.forward, &self.up)
    }

    pub fn projection_matrix(&self) -> Matrix4<f64> {
        projection_matrix(&self.projection)
    }

    pub fn view_projection(&self) -> Matrix4<f64> {
        view_projection(&self.position, &self.forward, &self.up, &self.projection)
    }

    /// Projects a world point to pixel coordinates (origin bottom-left).
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn world_to_screen(&self, point: &Point3<f64>) -> Option<(f64, f64)> {
        let clip = self.view_projection() * point.to_homogeneous();
        if clip.w <= MIN_CLIP_W {
            return None;
        }
        let ndc_x = clip.x / clip.w;
        let ndc_y = clip.y / clip.w;
        let width = f64::from(self.projection.viewport_width);
        let height = f64::from(self.projection.viewport_height);
        Some(((ndc_x + 1.0) * 0.5 * width, (ndc_y + 1.0) * 0.5 * height))
    }

    /// Cosine between the view direction and the direction to `point`.
    pub fn view_alignment(&self, point: &Point3<f64>) -> f64 {
        crate::geometry::direction_similarity(&self.forward, &(point - self.position))
    }

    pub fn distance_to(&self, point: &Point3<f64>) -> f64 {
        nalgebra::distance(&self.position, point)
    }
}

fn view_matrix(position: &Point3<f64>, forward: &Vector3<f64>, up: &Vector3<f64>) -> Matrix4<f64> {
    let target = position + forward;
    Isometry3::look_at_rh(position, &target, up).to_homogeneous()
}

fn projection_matrix(p: &ProjectionParams) -> Matrix4<f64> {
    Perspective3::new(p.aspect, p.fov_y_deg.to_radians(), p.near, p.far).to_homogeneous()
}

fn view_projection(
    position: &Point3<f64>,
    forward: &Vector3<f64>,
    up: &Vector3<f64>,
    projection: &ProjectionParams,
) -> Matrix4<f64> {
    projection_matrix(projection) * view_matrix(position, forward, up)
}

/// Normalizes `forward` and re-orthogonalizes `up` against it, falling back
/// to -Z forward and +Y/+Z up for degenerate input.
fn orthonormal_basis(forward: Vector3<f64>, up: Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let forward = forward
        .try_normalize(1e-12)
        .unwrap_or_else(|| -Vector3::z());
    let up = (up - forward * forward.dot(&up))
        .try_normalize(1e-12)
        .or_else(|| {
            let fallback = Vector3::y();
            (fallback - forward * forward.dot(&fallback)).try_normalize(1e-12)
        })
        .unwrap_or_else(Vector3::z);
    (forward, up)
}

fn sanitize_projection(p: ProjectionParams) -> ProjectionParams {
    let defaults = ProjectionParams::default();
    let fov_ok = p.fov_y_deg.is_finite() && p.fov_y_deg > 0.0 && p.fov_y_deg < 180.0;
    let near_ok = p.near.is_finite() && p.near > 0.0;
    let far_ok = p.far.is_finite() && p.far > p.near;
    ProjectionParams {
        fov_y_deg: if fov_ok { p.fov_y_deg } else { defaults.fov_y_deg },
        aspect: if p.aspect.is_finite() && p.aspect > 0.0 { p.aspect } else { defaults.aspect },
        near: if near_ok { p.near } else { defaults.near },
        far: if near_ok && far_ok { p.far } else { defaults.far },
        viewport_width: p.viewport_width.max(1),
        viewport_height: p.viewport_height.max(1),
    }
}
