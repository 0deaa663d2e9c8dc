use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

/// How pixel positions map onto the pitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calibration {
    /// Uniform scale, as when the camera looks straight down.
    PixelsPerMeter(f32),
    /// Four pixel points and the pitch coordinates (metres) they correspond to.
    Homography {
        pixel: [[f32; 2]; 4],
        pitch: [[f32; 2]; 4],
    },
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::PixelsPerMeter(20.0)
    }
}

impl Calibration {
    pub fn validate(&self) -> Result<(), Error> {
        ViewTransformer::new(self).map(|_| ())
    }
}

/// Maps camera-compensated pixel coordinates to metres.
#[derive(Debug, Clone)]
pub enum ViewTransformer {
    Scale(f32),
    Perspective(na::Matrix3<f64>),
}

impl ViewTransformer {
    pub fn new(calibration: &Calibration) -> Result<Self, Error> {
        match calibration {
            Calibration::PixelsPerMeter(ppm) => {
                if *ppm > 0.0 && ppm.is_finite() {
                    Ok(ViewTransformer::Scale(*ppm))
                } else {
                    Err(Error::Config(format!("pixels per meter must be positive, got {}", ppm)))
                }
            }
            Calibration::Homography { pixel, pitch } => perspective_transform(pixel, pitch)
                .map(ViewTransformer::Perspective)
                .ok_or_else(|| {
                    Error::Config("calibration points do not define a perspective transform".into())
                }),
        }
    }

    pub fn to_pitch(&self, p: na::Point2<f32>) -> Option<na::Point2<f32>> {
        match self {
            ViewTransformer::Scale(ppm) => Some(na::Point2::new(p.x / ppm, p.y / ppm)),
            ViewTransformer::Perspective(h) => {
                let v = h * na::Vector3::new(p.x as f64, p.y as f64, 1.0);
                if v.z.abs() < 1e-12 {
                    return None;
                }

                Some(na::Point2::new((v.x / v.z) as f32, (v.y / v.z) as f32))
            }
        }
    }
}

/// Solves the 3x3 homography taking `src` onto `dst` (h33 = 1).
pub fn perspective_transform(src: &[[f32; 2]; 4], dst: &[[f32; 2]; 4]) -> Option<na::Matrix3<f64>> {
    let mut a = na::SMatrix::<f64, 8, 8>::zeros();
    let mut b = na::SVector::<f64, 8>::zeros();

    for i in 0..4 {
        let (x, y) = (src[i][0] as f64, src[i][1] as f64);
        let (u, v) = (dst[i][0] as f64, dst[i][1] as f64);

        let r = 2 * i;
        a.set_row(
            r,
            &na::SMatrix::<f64, 1, 8>::from_row_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y]),
        );
        a.set_row(
            r + 1,
            &na::SMatrix::<f64, 1, 8>::from_row_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y]),
        );
        b[r] = u;
        b[r + 1] = v;
    }

    let h = a.lu().solve(&b)?;
    if h.iter().any(|v| !v.is_finite()) {
        return None;
    }

    Some(na::Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}
