//! The "VISIBILITY" Engine - frustum tests and on-screen size estimation.
//!
//! Per (entity, viewer) pair:
//! 1. Corner test: visible iff one of the 8 box corners is inside all 6 planes
//! 2. Projection: corners → pixels, enclosing rectangle
//! 3. Size ratio: `(min(⌊w/96⌋/10, 1) + min(⌊h/96⌋/10, 1)) / 2`
//! 4. Output sizing: weight-adjusted ratio clamped to [0.3, 1], resolution
//!    rounded down to a multiple of 8, level of detail
//!
//! Hidden entities get a degraded report (zero ortho size, minimum tier)
//! rather than an error.

use crate::entity::EntityState;
use crate::geometry::{BoundingBox, Frustum, ScreenRect};
use crate::viewer::ViewerState;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the VisibilityEvaluator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Distance within which a viewer can see a cluster member (default: 10.0)
    pub visibility_radius: f64,

    /// Pixel span normalizing the projected size (default: 96.0)
    pub pixel_normalization: f64,

    /// Lower clamp of the adjusted size ratio (default: 0.3)
    pub min_size_ratio: f64,

    /// Upper clamp of the adjusted size ratio (default: 1.0)
    pub max_size_ratio: f64,

    /// Full-quality capture resolution (default: 1920×1080)
    pub base_resolution: (u32, u32),

    /// Output resolutions are multiples of this (default: 8)
    pub resolution_step: u32,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            visibility_radius: 10.0,
            pixel_normalization: 96.0,
            min_size_ratio: 0.3,
            max_size_ratio: 1.0,
            base_resolution: (1920, 1080),
            resolution_step: 8,
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

/// Level of detail requested from the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LodLevel {
    High,
    Medium,
    Low,
}

impl LodLevel {
    /// Numeric level, 0 = most detailed.
    pub fn index(&self) -> u8 {
        match self {
            LodLevel::High => 0,
            LodLevel::Medium => 1,
            LodLevel::Low => 2,
        }
    }
}

/// Visibility and size of one entity for one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewReport {
    pub visible: bool,

    /// Normalized on-screen size in [0, 1]
    pub size_ratio: f64,

    /// Enclosing pixel rectangle of the projected corners
    pub screen_rect: Option<ScreenRect>,

    /// Orthographic-equivalent half height covering the box (0 when hidden)
    pub ortho_size: f64,
}

impl ViewReport {
    /// Degraded report for an entity the viewer cannot see.
    pub fn hidden() -> Self {
        Self {
            visible: false,
            size_ratio: 0.0,
            screen_rect: None,
            ortho_size: 0.0,
        }
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct VisibilityEvaluator {
    config: VisibilityConfig,
}

impl VisibilityEvaluator {
    pub fn new(config: VisibilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    /// True iff at least one bounding corner is inside the frustum.
    pub fn is_visible(&self, entity: &EntityState, frustum: &Frustum) -> bool {
        frustum.contains_any_corner(&entity.corners())
    }

    /// Normalized on-screen size; 0 when not visible.
    pub fn on_screen_size(&self, entity: &EntityState, viewer: &ViewerState) -> f64 {
        self.evaluate(entity, viewer).size_ratio
    }

    /// Full visibility and size report.
    pub fn evaluate(&self, entity: &EntityState, viewer: &ViewerState) -> ViewReport {
        self.evaluate_box(&entity.bounding_box(), viewer)
    }

    /// Visibility and size report for an arbitrary box (e.g. a whole cluster).
    pub fn evaluate_box(&self, bbox: &BoundingBox, viewer: &ViewerState) -> ViewReport {
        let corners = bbox.corners();
        if !viewer.frustum.contains_any_corner(&corners) {
            return ViewReport::hidden();
        }

        let Some(rect) = ScreenRect::enclosing(corners.iter().filter_map(|c| viewer.world_to_screen(c))) else {
            return ViewReport::hidden();
        };

        ViewReport {
            visible: true,
            size_ratio: self.size_ratio(&rect),
            screen_rect: Some(rect),
            ortho_size: ortho_size(bbox, viewer),
        }
    }

    /// `(min(⌊w/n⌋/10, 1) + min(⌊h/n⌋/10, 1)) / 2` for normalization n.
    pub fn size_ratio(&self, rect: &ScreenRect) -> f64 {
        let n = self.config.pixel_normalization.max(f64::EPSILON);
        let term = |span: f64| ((span.max(0.0) / n).floor() / 10.0).min(1.0);
        (term(rect.width()) + term(rect.height())) / 2.0
    }

    /// Applies the cluster-weight factor and clamps to the configured range.
    pub fn adjusted_ratio(&self, raw_ratio: f64, weight_factor: f64) -> f64 {
        let ratio = raw_ratio * weight_factor;
        if ratio.is_finite() {
            ratio.clamp(self.config.min_size_ratio, self.config.max_size_ratio)
        } else {
            self.config.min_size_ratio
        }
    }

    /// Capture resolution for a size ratio, a multiple of the step, at least one step.
    pub fn resolution_for(&self, ratio: f64) -> (u32, u32) {
        let (width, height) = self.config.base_resolution;
        let step = self.config.resolution_step.max(1);
        let ratio = if ratio.is_finite() { ratio.max(0.0) } else { 0.0 };
        let scale = |base: u32| {
            let scaled = (f64::from(base) * ratio).round() as u32;
            ((scaled / step) * step).max(step)
        };
        (scale(width), scale(height))
    }

    /// Level of detail for a size ratio.
    pub fn lod_for(&self, ratio: f64) -> LodLevel {
        if ratio > 0.8 {
            LodLevel::High
        } else if ratio > 0.5 {
            LodLevel::Medium
        } else {
            LodLevel::Low
        }
    }

    /// True if any of the positions is within the visibility radius.
    pub fn in_range<'a, I>(&self, positions: I, viewer: &ViewerState) -> bool
    where
        I: IntoIterator<Item = &'a Point3<f64>>,
    {
        positions
            .into_iter()
            .any(|p| viewer.distance_to(p) <= self.config.visibility_radius)
    }
}

/// Half height of an orthographic view framing the box from the viewer.
fn ortho_size(bbox: &BoundingBox, viewer: &ViewerState) -> f64 {
    let size = bbox.size();
    let aspect = viewer.projection.aspect.max(f64::EPSILON);
    (size.y.max(size.x / aspect)) / 2.0
}

// ============================================================================
// TESTS
// ============================================================================
