//! Parametric disc outlines in original-image pixel coordinates.

use serde::{Deserialize, Serialize};

/// A detected disc outline. Circles cover the common face-on shot; tilted
/// or perspective-distorted discs fall back to ellipses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Border {
    Circle {
        cx: f32,
        cy: f32,
        radius: f32,
        confidence: f32,
    },
    Ellipse {
        cx: f32,
        cy: f32,
        /// Semi-major axis; always >= `minor`.
        major: f32,
        minor: f32,
        /// Rotation of the major axis from the image x-axis, in degrees.
        angle_deg: f32,
        confidence: f32,
    },
}

impl Border {
    pub fn confidence(&self) -> f32 {
        match self {
            Border::Circle { confidence, .. } | Border::Ellipse { confidence, .. } => *confidence,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        match self {
            Border::Circle { cx, cy, .. } | Border::Ellipse { cx, cy, .. } => (*cx, *cy),
        }
    }

    /// Axis-aligned bounding box, clamped to an image of the given size.
    /// Returned as (x, y, width, height); empty borders clamp to 1x1.
    pub fn bounding_box(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (cx, cy, ex, ey) = match *self {
            Border::Circle { cx, cy, radius, .. } => (cx, cy, radius, radius),
            Border::Ellipse { cx, cy, major, minor, angle_deg, .. } => {
                let theta = angle_deg.to_radians();
                let (sin, cos) = theta.sin_cos();
                // Half-extents of a rotated ellipse along the image axes.
                let ex = ((major * cos).powi(2) + (minor * sin).powi(2)).sqrt();
                let ey = ((major * sin).powi(2) + (minor * cos).powi(2)).sqrt();
                (cx, cy, ex, ey)
            }
        };
        let x0 = (cx - ex).floor().max(0.0) as u32;
        let y0 = (cy - ey).floor().max(0.0) as u32;
        let x1 = ((cx + ex).ceil() as u32).min(width.saturating_sub(1));
        let y1 = ((cy + ey).ceil() as u32).min(height.saturating_sub(1));
        let x0 = x0.min(x1);
        let y0 = y0.min(y1);
        (x0, y0, x1 - x0 + 1, y1 - y0 + 1)
    }

    /// Whether the pixel (x, y) falls inside the outline.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        match *self {
            Border::Circle { cx, cy, radius, .. } => {
                let dx = x - cx;
                let dy = y - cy;
                dx * dx + dy * dy <= radius * radius
            }
            Border::Ellipse { cx, cy, major, minor, angle_deg, .. } => {
                if major <= 0.0 || minor <= 0.0 {
                    return false;
                }
                let theta = angle_deg.to_radians();
                let (sin, cos) = theta.sin_cos();
                let dx = x - cx;
                let dy = y - cy;
                // Rotate into the ellipse frame.
                let u = dx * cos + dy * sin;
                let v = -dx * sin + dy * cos;
                (u / major).powi(2) + (v / minor).powi(2) <= 1.0
            }
        }
    }
}

/// Knobs for both detector stages.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    /// Detections below this confidence are discarded.
    pub confidence_floor: f32,
    /// Minimum radius as a fraction of min(width, height) / 2.
    pub min_radius_frac: f32,
    /// Maximum radius as a fraction of min(width, height) / 2.
    pub max_radius_frac: f32,
    /// Gaussian blur applied before gradient extraction.
    pub blur_sigma: f32,
    /// Edge pixels must exceed this fraction of the strongest gradient.
    pub gradient_threshold: f32,
    /// Number of radii sampled between min and max.
    pub radius_steps: usize,
    /// Candidate centers may sit off-image by this fraction of min(w, h).
    pub center_margin_frac: f32,
    /// Adaptive-threshold window as a fraction of min(width, height).
    pub threshold_window_frac: f32,
    /// Adaptive-threshold offset on the 0-255 scale.
    pub threshold_offset: u8,
    /// Contours smaller than this fraction of the image area are discarded.
    pub min_area_frac: f32,
    /// Contours with area / hull-area below this are discarded.
    pub min_convexity: f32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            confidence_floor: 0.35,
            min_radius_frac: 0.25,
            max_radius_frac: 1.0,
            blur_sigma: 1.4,
            gradient_threshold: 0.25,
            radius_steps: 32,
            center_margin_frac: 0.05,
            threshold_window_frac: 0.5,
            threshold_offset: 12,
            min_area_frac: 0.05,
            min_convexity: 0.8,
        }
    }
}
