//! Ellipse stage: adaptive threshold, connected contours, moment fit.
//!
//! This stage only runs when the circle stage comes up empty; it recovers
//! discs that tilt or perspective has stretched away from circularity.

use crate::border::shape::{Border, DetectorParams};
use bitvec::prelude::*;
use image::GrayImage;

#[derive(Debug, Clone, Copy)]
struct EllipseFit {
    cx: f32,
    cy: f32,
    major: f32,
    minor: f32,
    angle_deg: f32,
    area: f32,
    score: f32,
}

/// Summed-area table with a one-pixel apron, for O(1) window means.
fn integral_image(gray: &GrayImage) -> Vec<u64> {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut sat = vec![0u64; (w + 1) * (h + 1)];
    let stride = w + 1;
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += gray.as_raw()[y * w + x] as u64;
            sat[(y + 1) * stride + (x + 1)] = sat[y * stride + (x + 1)] + row_sum;
        }
    }
    sat
}

fn window_mean(sat: &[u64], w: usize, h: usize, x: usize, y: usize, half: usize) -> f32 {
    let x0 = x.saturating_sub(half);
    let y0 = y.saturating_sub(half);
    let x1 = (x + half + 1).min(w);
    let y1 = (y + half + 1).min(h);
    let stride = w + 1;
    let sum = sat[y1 * stride + x1] + sat[y0 * stride + x0]
        - sat[y0 * stride + x1]
        - sat[y1 * stride + x0];
    sum as f32 / ((x1 - x0) * (y1 - y0)) as f32
}

/// Binarizes against the local window mean. `dark` selects which polarity
/// counts as foreground, so both dark-on-light and light-on-dark discs get
/// a pass.
fn adaptive_threshold(gray: &GrayImage, params: &DetectorParams, dark: bool) -> BitVec {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let window = ((params.threshold_window_frac * w.min(h) as f32) as usize).max(3);
    let half = window / 2;
    let offset = params.threshold_offset as f32;
    let sat = integral_image(gray);
    let mut mask = bitvec![0; w * h];
    for y in 0..h {
        for x in 0..w {
            let mean = window_mean(&sat, w, h, x, y, half);
            let v = gray.as_raw()[y * w + x] as f32;
            let fg = if dark { v < mean - offset } else { v > mean + offset };
            if fg {
                mask.set(y * w + x, true);
            }
        }
    }
    mask
}

/// One 4-connected foreground component: its pixels and boundary.
struct Component {
    pixels: Vec<(u32, u32)>,
    boundary: Vec<(u32, u32)>,
}

fn connected_components(mask: &BitSlice, w: usize, h: usize, min_area: usize) -> Vec<Component> {
    let mut visited = bitvec![0; w * h];
    let mut components = Vec::new();
    let mut stack = Vec::new();
    for start in 0..w * h {
        if !mask[start] || visited[start] {
            continue;
        }
        let mut pixels = Vec::new();
        let mut boundary = Vec::new();
        visited.set(start, true);
        stack.push(start);
        while let Some(i) = stack.pop() {
            let (x, y) = (i % w, i / w);
            pixels.push((x as u32, y as u32));
            let mut on_boundary = x == 0 || y == 0 || x == w - 1 || y == h - 1;
            let neighbors = [
                (x > 0).then(|| i - 1),
                (x + 1 < w).then(|| i + 1),
                (y > 0).then(|| i - w),
                (y + 1 < h).then(|| i + w),
            ];
            for n in neighbors.into_iter().flatten() {
                if mask[n] {
                    if !visited[n] {
                        visited.set(n, true);
                        stack.push(n);
                    }
                } else {
                    on_boundary = true;
                }
            }
            if on_boundary {
                boundary.push((x as u32, y as u32));
            }
        }
        if pixels.len() >= min_area {
            components.push(Component { pixels, boundary });
        }
    }
    components
}

/// Convex hull area via Andrew's monotone chain (points need not be sorted).
fn hull_area(points: &[(u32, u32)]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut pts: Vec<(i64, i64)> = points.iter().map(|&(x, y)| (x as i64, y as i64)).collect();
    pts.sort_unstable();
    pts.dedup();
    if pts.len() < 3 {
        return 0.0;
    }
    let cross = |o: (i64, i64), a: (i64, i64), b: (i64, i64)| -> i64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };
    let mut lower: Vec<(i64, i64)> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<(i64, i64)> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    let hull: Vec<(i64, i64)> = lower.into_iter().chain(upper).collect();
    if hull.len() < 3 {
        return 0.0;
    }
    // Shoelace.
    let mut twice_area = 0i64;
    for i in 0..hull.len() {
        let (x0, y0) = hull[i];
        let (x1, y1) = hull[(i + 1) % hull.len()];
        twice_area += x0 * y1 - x1 * y0;
    }
    (twice_area.abs() as f32) / 2.0
}

/// Fits an ellipse to a component by its second-order region moments and
/// scores it on fit residual, centering, and frame coverage.
fn fit_component(component: &Component, w: usize, h: usize) -> Option<EllipseFit> {
    let n = component.pixels.len() as f64;
    if n < 16.0 {
        return None;
    }
    let (mut sx, mut sy) = (0.0f64, 0.0f64);
    for &(x, y) in &component.pixels {
        sx += x as f64;
        sy += y as f64;
    }
    let (cx, cy) = (sx / n, sy / n);
    let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
    for &(x, y) in &component.pixels {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }
    mu20 /= n;
    mu02 /= n;
    mu11 /= n;

    let common = ((mu20 - mu02).powi(2) + 4.0 * mu11 * mu11).sqrt();
    let lambda1 = (mu20 + mu02 + common) / 2.0;
    let lambda2 = (mu20 + mu02 - common) / 2.0;
    if lambda1 <= 0.0 || lambda2 <= 0.0 {
        return None;
    }
    // For a solid ellipse the second moment along an axis is (semi-axis)^2 / 4.
    let major = 2.0 * lambda1.sqrt();
    let minor = 2.0 * lambda2.sqrt();
    let angle = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);

    // Mean algebraic distance of boundary points from the fitted outline.
    let (sin, cos) = angle.sin_cos();
    let mut residual = 0.0f64;
    for &(x, y) in &component.boundary {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        residual += ((u / major).powi(2) + (v / minor).powi(2) - 1.0).abs();
    }
    residual /= component.boundary.len().max(1) as f64;
    let fit_term = 1.0 / (1.0 + 4.0 * residual);

    let half_diag = ((w * w + h * h) as f64).sqrt() / 2.0;
    let center_dist = ((cx - w as f64 / 2.0).powi(2) + (cy - h as f64 / 2.0).powi(2)).sqrt();
    let center_term = (1.0 - center_dist / half_diag).max(0.0);

    let area = std::f64::consts::PI * major * minor;
    let area_term = (area / (w * h) as f64).min(1.0);

    let score = 0.5 * fit_term + 0.25 * center_term + 0.25 * area_term;
    Some(EllipseFit {
        cx: cx as f32,
        cy: cy as f32,
        major: major as f32,
        minor: minor as f32,
        angle_deg: angle.to_degrees() as f32,
        area: area as f32,
        score: score as f32,
    })
}

/// Runs the ellipse stage. Returns `None` when no fit clears the floor.
pub fn detect_ellipse(blurred: &GrayImage, params: &DetectorParams) -> Option<Border> {
    let (w, h) = (blurred.width() as usize, blurred.height() as usize);
    if w < 8 || h < 8 {
        return None;
    }
    let min_area = ((params.min_area_frac * (w * h) as f32) as usize).max(16);

    let mut fits: Vec<EllipseFit> = Vec::new();
    for dark in [true, false] {
        let mask = adaptive_threshold(blurred, params, dark);
        for component in connected_components(&mask, w, h, min_area) {
            // The hull of the boundary equals the hull of the region.
            let hull = hull_area(&component.boundary);
            if hull <= 0.0 {
                continue;
            }
            let convexity = component.pixels.len() as f32 / hull;
            if convexity < params.min_convexity {
                continue;
            }
            if let Some(fit) = fit_component(&component, w, h) {
                fits.push(fit);
            }
        }
    }

    // Best score wins; ties go to the larger area.
    let best = fits.into_iter().fold(None::<EllipseFit>, |best, f| match best {
        None => Some(f),
        Some(b) if f.score > b.score || (f.score == b.score && f.area > b.area) => Some(f),
        Some(b) => Some(b),
    })?;

    #[cfg(feature = "border-trace")]
    log::debug!(
        "ellipse stage best: center ({:.1}, {:.1}) axes ({:.1}, {:.1}) angle {:.1} score {:.3}",
        best.cx, best.cy, best.major, best.minor, best.angle_deg, best.score
    );

    if best.score < params.confidence_floor {
        return None;
    }
    Some(Border::Ellipse {
        cx: best.cx,
        cy: best.cy,
        major: best.major,
        minor: best.minor,
        angle_deg: best.angle_deg,
        confidence: best.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, imageops};

    fn ellipse_image(size: u32, cx: f32, cy: f32, a: f32, b: f32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            let dx = (x as f32 - cx) / a;
            let dy = (y as f32 - cy) / b;
            if dx * dx + dy * dy <= 1.0 { Rgb([50, 50, 50]) } else { Rgb([240, 240, 240]) }
        })
    }

    #[test]
    fn fits_axis_aligned_ellipse() {
        let img = ellipse_image(128, 64.0, 64.0, 42.0, 26.0);
        let gray = imageops::grayscale(&img);
        let blurred = imageops::blur(&gray, 1.4);
        let border = detect_ellipse(&blurred, &DetectorParams::default())
            .expect("ellipse stage should fit a clean synthetic ellipse");
        let Border::Ellipse { cx, cy, major, minor, .. } = border else {
            panic!("expected an ellipse");
        };
        assert!((cx - 64.0).abs() <= 3.0, "cx {cx}");
        assert!((cy - 64.0).abs() <= 3.0, "cy {cy}");
        assert!((major - 42.0).abs() <= 5.0, "major {major}");
        assert!((minor - 26.0).abs() <= 5.0, "minor {minor}");
    }

    #[test]
    fn major_axis_orientation_is_recovered() {
        // Tall ellipse: the major axis runs along y, i.e. angle near 90 degrees.
        let img = ellipse_image(128, 64.0, 64.0, 24.0, 44.0);
        let gray = imageops::grayscale(&img);
        let blurred = imageops::blur(&gray, 1.4);
        let border = detect_ellipse(&blurred, &DetectorParams::default()).expect("detection");
        let Border::Ellipse { major, minor, angle_deg, .. } = border else {
            panic!("expected an ellipse");
        };
        assert!(major >= minor, "major {major} < minor {minor}");
        assert!((angle_deg.abs() - 90.0).abs() <= 10.0, "angle {angle_deg}");
    }

    #[test]
    fn flat_image_yields_nothing() {
        let img = RgbImage::from_pixel(96, 96, Rgb([200, 200, 200]));
        let gray = imageops::grayscale(&img);
        assert!(detect_ellipse(&gray, &DetectorParams::default()).is_none());
    }

    #[test]
    fn hull_area_of_a_square() {
        let points: Vec<(u32, u32)> =
            (0..=10u32).flat_map(|x| (0..=10u32).map(move |y| (x, y))).collect();
        let area = hull_area(&points);
        assert!((area - 100.0).abs() < 1e-3, "area {area}");
    }
}
