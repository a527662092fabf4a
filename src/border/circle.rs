//! Circle stage: gradient-space Hough voting over (center_x, center_y, radius).

use crate::border::shape::{Border, DetectorParams};
use image::GrayImage;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Symmetric boundary extension (mirroring) for the gradient filters.
/// Out-of-bounds indices are reflected back into [0, max).
#[inline]
pub(crate) fn mirror(i: isize, max: isize) -> usize {
    if max <= 0 {
        return 0;
    }
    let mut v = i;
    if v < 0 {
        v = -v - 1;
    }
    if v >= max {
        v = 2 * max - 1 - v;
    }
    v.clamp(0, max - 1) as usize
}

/// An edge pixel with its unit gradient direction.
struct EdgePoint {
    x: f32,
    y: f32,
    ux: f32,
    uy: f32,
}

#[derive(Debug, Clone, Copy)]
struct CircleCandidate {
    cx: f32,
    cy: f32,
    radius: f32,
    /// Raw normalized vote mass; may exceed 1 on thick edge rings. Kept
    /// unclamped so ranking between radii stays sharp; clamped only when
    /// the winning candidate is reported.
    vote_mass: f32,
}

/// 3x3 Sobel over the blurred grayscale raster. Returns (gx, gy) planes.
fn sobel(gray: &GrayImage) -> (Vec<f32>, Vec<f32>) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let pixel = |x: isize, y: isize| -> f32 {
        gray.as_raw()[mirror(y, h as isize) * w + mirror(x, w as isize)] as f32
    };
    let mut gx = vec![0.0f32; w * h];
    let mut gy = vec![0.0f32; w * h];
    for y in 0..h as isize {
        for x in 0..w as isize {
            let tl = pixel(x - 1, y - 1);
            let tc = pixel(x, y - 1);
            let tr = pixel(x + 1, y - 1);
            let ml = pixel(x - 1, y);
            let mr = pixel(x + 1, y);
            let bl = pixel(x - 1, y + 1);
            let bc = pixel(x, y + 1);
            let br = pixel(x + 1, y + 1);
            let i = y as usize * w + x as usize;
            gx[i] = (tr + 2.0 * mr + br) - (tl + 2.0 * ml + bl);
            gy[i] = (bl + 2.0 * bc + br) - (tl + 2.0 * tc + tr);
        }
    }
    (gx, gy)
}

fn collect_edges(gray: &GrayImage, threshold_frac: f32) -> Vec<EdgePoint> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let (gx, gy) = sobel(gray);
    let mut max_mag = 0.0f32;
    let mag: Vec<f32> = gx
        .iter()
        .zip(gy.iter())
        .map(|(&x, &y)| {
            let m = (x * x + y * y).sqrt();
            if m > max_mag {
                max_mag = m;
            }
            m
        })
        .collect();
    if max_mag <= f32::EPSILON {
        return Vec::new();
    }
    let floor = threshold_frac * max_mag;
    let mut edges = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            if mag[i] >= floor {
                edges.push(EdgePoint {
                    x: x as f32,
                    y: y as f32,
                    ux: gx[i] / mag[i],
                    uy: gy[i] / mag[i],
                });
            }
        }
    }
    edges
}

/// Accumulates center votes for one radius and returns the best peak.
///
/// Every edge pixel votes twice, once along its gradient and once against
/// it, so the polarity of the disc against its background does not matter.
/// The returned confidence is the 3x3 vote mass around the peak normalized
/// by the circumference, i.e. by the vote count a full, perfect circle of
/// this radius would produce.
fn vote_radius(edges: &[EdgePoint], radius: f32, grid_w: usize, grid_h: usize, margin: f32) -> Option<CircleCandidate> {
    let mut acc = vec![0u32; grid_w * grid_h];
    for e in edges {
        for dir in [-1.0f32, 1.0] {
            let cx = e.x + dir * radius * e.ux + margin;
            let cy = e.y + dir * radius * e.uy + margin;
            let ix = cx.round();
            let iy = cy.round();
            if ix < 0.0 || iy < 0.0 {
                continue;
            }
            let (ix, iy) = (ix as usize, iy as usize);
            if ix < grid_w && iy < grid_h {
                acc[iy * grid_w + ix] += 1;
            }
        }
    }

    let mut best_votes = 0u32;
    let mut best_cell = 0usize;
    for (i, &v) in acc.iter().enumerate() {
        if v > best_votes {
            best_votes = v;
            best_cell = i;
        }
    }
    if best_votes == 0 {
        return None;
    }

    let px = (best_cell % grid_w) as isize;
    let py = (best_cell / grid_w) as isize;
    let mut mass = 0u32;
    for dy in -1..=1isize {
        for dx in -1..=1isize {
            let x = px + dx;
            let y = py + dy;
            if x >= 0 && y >= 0 && (x as usize) < grid_w && (y as usize) < grid_h {
                mass += acc[y as usize * grid_w + x as usize];
            }
        }
    }

    let circumference = 2.0 * std::f32::consts::PI * radius;
    Some(CircleCandidate {
        cx: px as f32 - margin,
        cy: py as f32 - margin,
        radius,
        vote_mass: mass as f32 / circumference,
    })
}

/// Runs the circle stage. Returns `None` when no candidate clears the
/// configured confidence floor.
pub fn detect_circle(blurred: &GrayImage, params: &DetectorParams) -> Option<Border> {
    let (w, h) = (blurred.width() as f32, blurred.height() as f32);
    let half_min = w.min(h) / 2.0;
    let r_min = params.min_radius_frac * half_min;
    let r_max = params.max_radius_frac * half_min;
    if r_max < 1.0 || r_min > r_max {
        return None;
    }

    let edges = collect_edges(blurred, params.gradient_threshold);
    if edges.is_empty() {
        return None;
    }

    let margin = params.center_margin_frac * w.min(h);
    let grid_w = (w + 2.0 * margin).ceil() as usize + 1;
    let grid_h = (h + 2.0 * margin).ceil() as usize + 1;

    let steps = params.radius_steps.max(2);
    let radii: Vec<f32> = (0..steps)
        .map(|i| r_min + (r_max - r_min) * i as f32 / (steps - 1) as f32)
        .collect();

    #[cfg(feature = "rayon")]
    let candidates: Vec<CircleCandidate> = radii
        .par_iter()
        .filter_map(|&r| vote_radius(&edges, r, grid_w, grid_h, margin))
        .collect();
    #[cfg(not(feature = "rayon"))]
    let candidates: Vec<CircleCandidate> = radii
        .iter()
        .filter_map(|&r| vote_radius(&edges, r, grid_w, grid_h, margin))
        .collect();

    // Highest vote mass wins; ties go to the larger radius.
    let best = candidates.into_iter().fold(None::<CircleCandidate>, |best, c| match best {
        None => Some(c),
        Some(b) if c.vote_mass > b.vote_mass
            || (c.vote_mass == b.vote_mass && c.radius > b.radius) => Some(c),
        Some(b) => Some(b),
    })?;
    let confidence = best.vote_mass.min(1.0);

    #[cfg(feature = "border-trace")]
    log::debug!(
        "circle stage peak: center ({:.1}, {:.1}) radius {:.1} confidence {:.3}",
        best.cx, best.cy, best.radius, confidence
    );

    if confidence < params.confidence_floor {
        return None;
    }
    if best.radius < r_min || best.radius > r_max {
        return None;
    }
    if best.cx < -margin || best.cy < -margin || best.cx > w + margin || best.cy > h + margin {
        return None;
    }
    Some(Border::Circle { cx: best.cx, cy: best.cy, radius: best.radius, confidence })
}
