//! Global camera motion between consecutive frames.
//!
//! Background corners (Shi-Tomasi response on the luma plane, away from any
//! tracked box) are matched into the next frame with a SAD block search.
//! Each correspondence is a translation hypothesis; the one most others agree
//! with wins and is refined by averaging its inliers.

use nalgebra as na;
use ndarray::prelude::*;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bbox::{BBox, Ltwh};
use crate::config::MotionConfig;

/// Displacement of the background from the previous frame to the current one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CameraTransform {
    pub dx: f32,
    pub dy: f32,
    /// Corners that found a match in the current frame.
    pub features: usize,
    pub inliers: usize,
    /// `false` when the estimate fell back to identity.
    pub compensated: bool,
}

impl CameraTransform {
    pub fn identity() -> Self {
        Self {
            dx: 0.0,
            dy: 0.0,
            features: 0,
            inliers: 0,
            compensated: true,
        }
    }

    fn fallback(features: usize, inliers: usize) -> Self {
        Self {
            dx: 0.0,
            dy: 0.0,
            features,
            inliers,
            compensated: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    x: usize,
    y: usize,
    response: f64,
}

pub struct CameraMotionEstimator {
    config: MotionConfig,
    prev: Option<Array2<f32>>,
    offset: na::Vector2<f32>,
    uncompensated: u64,
}

impl CameraMotionEstimator {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            prev: None,
            offset: na::Vector2::zeros(),
            uncompensated: 0,
        }
    }

    /// Accumulated background displacement since the first frame.
    #[inline]
    pub fn offset(&self) -> na::Vector2<f32> {
        self.offset
    }

    #[inline]
    pub fn uncompensated_frames(&self) -> u64 {
        self.uncompensated
    }

    /// Maps a pixel of the current frame into first-frame coordinates.
    #[inline]
    pub fn compensate(&self, p: na::Point2<f32>) -> na::Point2<f32> {
        p - self.offset
    }

    /// Feeds the next luma plane, updating the cumulative offset.
    ///
    /// `exclude` holds the boxes of live tracks; corners inside them are not used.
    pub fn process(&mut self, gray: Array2<f32>, exclude: &[BBox<Ltwh>]) -> CameraTransform {
        let transform = match self.prev.as_ref() {
            None => CameraTransform::identity(),
            Some(prev) if prev.dim() != gray.dim() => {
                warn!(prev = ?prev.dim(), curr = ?gray.dim(), "frame size changed, camera motion reset");
                CameraTransform::fallback(0, 0)
            }
            Some(prev) => self.estimate(prev, &gray, exclude),
        };

        if transform.compensated {
            self.offset += na::Vector2::new(transform.dx, transform.dy);
        } else {
            self.uncompensated += 1;
        }

        self.prev = Some(gray);

        transform
    }

    pub fn estimate(&self, prev: &Array2<f32>, curr: &Array2<f32>, exclude: &[BBox<Ltwh>]) -> CameraTransform {
        if prev.dim() != curr.dim() {
            return CameraTransform::fallback(0, 0);
        }

        let corners = self.select_corners(prev, exclude);

        let r = self.config.patch_radius as isize;
        let sr = self.config.search_range as isize;

        let displacements: Vec<na::Vector2<f32>> = corners
            .iter()
            .filter_map(|c| match_patch(prev, curr, c.x as isize, c.y as isize, r, sr))
            .map(|(dx, dy)| na::Vector2::new(dx as f32, dy as f32))
            .collect();

        if displacements.len() < self.config.min_features {
            debug!(
                corners = corners.len(),
                matched = displacements.len(),
                "too few background features"
            );
            return CameraTransform::fallback(displacements.len(), 0);
        }

        let threshold = self.config.inlier_threshold;
        let (best, support) = displacements
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let support = displacements
                    .iter()
                    .filter(|o| (*o - d).norm() <= threshold)
                    .count();
                (i, support)
            })
            .fold((0usize, 0usize), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        let consensus = support as f32 / displacements.len() as f32;
        if consensus < self.config.min_consensus {
            debug!(consensus, matched = displacements.len(), "no displacement consensus");
            return CameraTransform::fallback(displacements.len(), support);
        }

        let hypothesis = displacements[best];
        let inliers: Vec<&na::Vector2<f32>> = displacements
            .iter()
            .filter(|o| (*o - hypothesis).norm() <= threshold)
            .collect();

        let mean = inliers
            .iter()
            .fold(na::Vector2::<f32>::zeros(), |acc, d| acc + *d)
            / inliers.len() as f32;

        let mean = if mean.norm() < self.config.min_displacement {
            na::Vector2::zeros()
        } else {
            mean
        };

        CameraTransform {
            dx: mean.x,
            dy: mean.y,
            features: displacements.len(),
            inliers: inliers.len(),
            compensated: true,
        }
    }

    fn select_corners(&self, gray: &Array2<f32>, exclude: &[BBox<Ltwh>]) -> Vec<Corner> {
        let (h, w) = gray.dim();
        let r = self.config.patch_radius;
        let border = r + self.config.search_range + 1;

        if w <= 2 * border || h <= 2 * border {
            return Vec::new();
        }

        let margin = self.config.box_margin;
        let blocked: Vec<BBox<Ltwh>> = exclude
            .iter()
            .map(|b| {
                BBox::ltwh(
                    b.left() - margin,
                    b.top() - margin,
                    b.width() + 2.0 * margin,
                    b.height() + 2.0 * margin,
                )
            })
            .collect();

        let tensor = StructureTensor::new(gray);
        let cell = self.config.min_distance.max(1);

        // strongest corner per cell keeps selected points spread out
        let mut corners = Vec::new();
        let mut cy = border;
        while cy < h - border {
            let mut cx = border;
            while cx < w - border {
                let mut best: Option<Corner> = None;

                for y in cy..(cy + cell).min(h - border) {
                    for x in cx..(cx + cell).min(w - border) {
                        let p = na::Point2::new(x as f32, y as f32);
                        if blocked.iter().any(|b| b.contains(p)) {
                            continue;
                        }

                        let response = tensor.min_eigenvalue(x, y, r);
                        if best.map(|b| response > b.response).unwrap_or(true) {
                            best = Some(Corner { x, y, response });
                        }
                    }
                }

                if let Some(c) = best {
                    corners.push(c);
                }

                cx += cell;
            }
            cy += cell;
        }

        let strongest = corners.iter().map(|c| c.response).fold(0.0f64, f64::max);
        if strongest <= f64::EPSILON {
            return Vec::new();
        }

        let floor = strongest * self.config.quality_level as f64;
        corners.retain(|c| c.response >= floor);
        corners.sort_by(|a, b| {
            b.response
                .total_cmp(&a.response)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        corners.truncate(self.config.max_features);

        corners
    }
}

/// Integral images of the gradient products, for O(1) window sums.
struct StructureTensor {
    xx: Array2<f64>,
    yy: Array2<f64>,
    xy: Array2<f64>,
}

impl StructureTensor {
    fn new(gray: &Array2<f32>) -> Self {
        let (h, w) = gray.dim();
        let mut xx = Array2::zeros((h + 1, w + 1));
        let mut yy = Array2::zeros((h + 1, w + 1));
        let mut xy = Array2::zeros((h + 1, w + 1));

        for y in 0..h {
            for x in 0..w {
                let gx = if x > 0 && x + 1 < w {
                    (gray[[y, x + 1]] - gray[[y, x - 1]]) as f64 * 0.5
                } else {
                    0.0
                };
                let gy = if y > 0 && y + 1 < h {
                    (gray[[y + 1, x]] - gray[[y - 1, x]]) as f64 * 0.5
                } else {
                    0.0
                };

                xx[[y + 1, x + 1]] = gx * gx + xx[[y, x + 1]] + xx[[y + 1, x]] - xx[[y, x]];
                yy[[y + 1, x + 1]] = gy * gy + yy[[y, x + 1]] + yy[[y + 1, x]] - yy[[y, x]];
                xy[[y + 1, x + 1]] = gx * gy + xy[[y, x + 1]] + xy[[y + 1, x]] - xy[[y, x]];
            }
        }

        Self { xx, yy, xy }
    }

    #[inline]
    fn window(integral: &Array2<f64>, x: usize, y: usize, r: usize) -> f64 {
        let (x0, y0, x1, y1) = (x - r, y - r, x + r + 1, y + r + 1);

        integral[[y1, x1]] - integral[[y0, x1]] - integral[[y1, x0]] + integral[[y0, x0]]
    }

    /// Smaller eigenvalue of the windowed structure tensor (Shi-Tomasi score).
    fn min_eigenvalue(&self, x: usize, y: usize, r: usize) -> f64 {
        let a = Self::window(&self.xx, x, y, r);
        let c = Self::window(&self.yy, x, y, r);
        let b = Self::window(&self.xy, x, y, r);

        let half_trace = (a + c) * 0.5;
        let det_term = ((a - c) * 0.5).powi(2) + b * b;

        half_trace - det_term.sqrt()
    }
}

/// Best integer displacement of the patch centered at (x, y), by SAD.
///
/// Matches on the edge of the search window are rejected, the true motion may lie beyond it.
fn match_patch(
    prev: &Array2<f32>,
    curr: &Array2<f32>,
    x: isize,
    y: isize,
    r: isize,
    search: isize,
) -> Option<(isize, isize)> {
    let (h, w) = (prev.dim().0 as isize, prev.dim().1 as isize);
    let reference = prev.slice(s![y - r..=y + r, x - r..=x + r]);

    let mut best: Option<(f32, isize, isize)> = None;

    for dy in -search..=search {
        let ty = y + dy;
        if ty - r < 0 || ty + r >= h {
            continue;
        }

        for dx in -search..=search {
            let tx = x + dx;
            if tx - r < 0 || tx + r >= w {
                continue;
            }

            let candidate = curr.slice(s![ty - r..=ty + r, tx - r..=tx + r]);
            let sad: f32 = reference
                .iter()
                .zip(candidate.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();

            let better = match best {
                None => true,
                Some((s, bx, by)) => {
                    sad < s || (sad == s && dx.abs() + dy.abs() < bx.abs() + by.abs())
                }
            };

            if better {
                best = Some((sad, dx, dy));
            }
        }
    }

    let (_, dx, dy) = best?;
    if dx.abs() == search || dy.abs() == search {
        return None;
    }

    Some((dx, dy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(x: i64, y: i64) -> f32 {
        let h = (x as u32).wrapping_mul(374_761_393) ^ (y as u32).wrapping_mul(668_265_263);
        let h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
        (h >> 24) as f32
    }

    /// Noise texture with its content moved by (dx, dy).
    fn shifted(w: usize, h: usize, dx: i64, dy: i64) -> Array2<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| texture(x as i64 - dx, y as i64 - dy))
    }

    #[test]
    fn recovers_a_pure_translation() {
        let est = CameraMotionEstimator::new(MotionConfig::default());
        let prev = shifted(160, 120, 0, 0);
        let curr = shifted(160, 120, 3, -2);

        let t = est.estimate(&prev, &curr, &[]);
        assert!(t.compensated);
        assert!((t.dx - 3.0).abs() < 1e-3, "dx = {}", t.dx);
        assert!((t.dy + 2.0).abs() < 1e-3, "dy = {}", t.dy);
    }

    #[test]
    fn flat_frame_is_uncompensated() {
        let est = CameraMotionEstimator::new(MotionConfig::default());
        let flat = Array2::from_elem((120, 160), 90.0f32);

        let t = est.estimate(&flat, &flat, &[]);
        assert!(!t.compensated);
        assert_eq!((t.dx, t.dy), (0.0, 0.0));
    }

    #[test]
    fn boxes_hide_their_content() {
        let est = CameraMotionEstimator::new(MotionConfig::default());
        let prev = shifted(160, 120, 0, 0);
        let curr = shifted(160, 120, 3, 0);

        let everything = [BBox::ltwh(0.0, 0.0, 160.0, 120.0)];
        assert!(!est.estimate(&prev, &curr, &everything).compensated);
    }

    #[test]
    fn offset_accumulates_across_frames() {
        let mut est = CameraMotionEstimator::new(MotionConfig::default());
        assert!(est.process(shifted(160, 120, 0, 0), &[]).compensated);
        est.process(shifted(160, 120, -4, 0), &[]);
        est.process(shifted(160, 120, -8, 0), &[]);

        assert!((est.offset().x + 8.0).abs() < 1e-3);

        // a point fixed on the pitch maps back to where it started
        let p = est.compensate(na::Point2::new(92.0, 50.0));
        assert!((p.x - 100.0).abs() < 1e-3);
    }

    #[test]
    fn still_camera_reports_zero() {
        let est = CameraMotionEstimator::new(MotionConfig::default());
        let frame = shifted(160, 120, 0, 0);
        let t = est.estimate(&frame, &frame, &[]);
        assert!(t.compensated);
        assert_eq!((t.dx, t.dy), (0.0, 0.0));
    }
}
