use ndarray::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::math::gauss;

const BIN_SHIFT: u8 = 5; // 8 bins per channel
const MIN_JERSEY_PIXELS: usize = 8;

/// Convert RGB to HSV.
/// Returns (H: 0-360, S: 0-1, V: 0-1).
#[inline]
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta < 1e-6 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let s = if max < 1e-6 { 0.0 } else { delta / max };

    (h, s, max)
}

/// Grass-like pixel: green hue with enough saturation and light.
#[inline]
pub fn is_pitch_green(r: u8, g: u8, b: u8) -> bool {
    let (h, s, v) = rgb_to_hsv(r, g, b);

    (70.0..=170.0).contains(&h) && s > 0.25 && v > 0.15
}

/// Dominant jersey color of a player crop.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ColorSignature {
    pub rgb: [f32; 3],
    /// Share of torso pixels that fell into the dominant color bin.
    pub purity: f32,
}

impl ColorSignature {
    pub fn new(rgb: [f32; 3]) -> Self {
        Self { rgb, purity: 1.0 }
    }

    #[inline]
    pub fn distance(&self, other: &ColorSignature) -> f32 {
        let d: f32 = self
            .rgb
            .iter()
            .zip(other.rgb.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();

        d.sqrt()
    }

    /// Appearance similarity in [0, 1].
    #[inline]
    pub fn similarity(&self, other: &ColorSignature) -> f32 {
        gauss(self.distance(other), 40.0)
    }

    #[inline]
    pub fn brightness(&self) -> f32 {
        (self.rgb[0] + self.rgb[1] + self.rgb[2]) / 3.0
    }

    #[inline]
    pub fn as_vector(&self) -> [f32; 3] {
        self.rgb
    }
}

/// Extracts the torso color signature of a person crop laid out as (h, w, rgb).
///
/// Uses the band between 15% and 50% of the box height and the central 60%
/// of its width, ignores pitch-green pixels, and returns the mean color of
/// the most populated coarse color bin.
pub fn torso_signature(crop: ArrayView3<'_, u8>) -> Option<ColorSignature> {
    let (h, w) = (crop.shape()[0], crop.shape()[1]);
    if h < 4 || w < 2 {
        return None;
    }

    let y0 = (h as f32 * 0.15) as usize;
    let y1 = ((h as f32 * 0.5) as usize).max(y0 + 1);
    let x0 = (w as f32 * 0.2) as usize;
    let x1 = ((w as f32 * 0.8) as usize).max(x0 + 1).min(w);

    let mut counts = [0u32; 512];
    let mut sums = [[0f32; 3]; 512];
    let mut total = 0usize;

    for y in y0..y1.min(h) {
        for x in x0..x1 {
            let (r, g, b) = (crop[[y, x, 0]], crop[[y, x, 1]], crop[[y, x, 2]]);
            if is_pitch_green(r, g, b) {
                continue;
            }

            let bin = ((r >> BIN_SHIFT) as usize) << 6
                | ((g >> BIN_SHIFT) as usize) << 3
                | (b >> BIN_SHIFT) as usize;

            counts[bin] += 1;
            sums[bin][0] += r as f32;
            sums[bin][1] += g as f32;
            sums[bin][2] += b as f32;
            total += 1;
        }
    }

    if total < MIN_JERSEY_PIXELS {
        return None;
    }

    // ties resolve to the lowest bin, keeping extraction deterministic
    let (best, count) = counts
        .iter()
        .enumerate()
        .fold((0usize, 0u32), |acc, (i, &c)| if c > acc.1 { (i, c) } else { acc });

    let n = count as f32;

    Some(ColorSignature {
        rgb: [sums[best][0] / n, sums[best][1] / n, sums[best][2] / n],
        purity: n / total as f32,
    })
}
