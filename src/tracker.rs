use super::math;
use super::predictor::Predictor;
use crate::bbox::{BBox, Ltwh};
use crate::color::ColorSignature;
use crate::detection::Detection;

/// Appearance blending factor applied on every matched observation.
const APPEARANCE_EMA: f32 = 0.1;
/// Lower bound of the proximity kernel width, in pixels.
const MIN_SPREAD: f32 = 16.0;

/// Per-track association state: motion model plus a running appearance.
#[derive(Debug, Clone)]
pub struct Object {
    pub predictor: Predictor,
    pub appearance: Option<ColorSignature>,
}

impl Object {
    pub fn new(
        horizon: usize,
        frame_index: u64,
        bbox: &BBox<Ltwh>,
        appearance: Option<ColorSignature>,
    ) -> Self {
        Self {
            predictor: Predictor::new(horizon, bbox, frame_index),
            appearance,
        }
    }

    #[inline]
    pub fn predict(&self, frame_index: u64) -> Option<BBox<Ltwh>> {
        self.predictor.predict(frame_index)
    }

    /// Motion agreement in [0, 1] between the predicted box and a detection.
    ///
    /// IoU dominates; small or fast objects that no longer overlap their
    /// prediction still score through a center-distance kernel capped at 0.5.
    pub fn motion_score(&self, frame_index: u64, det: &Detection) -> f32 {
        let predicted = match self.predict(frame_index) {
            Some(p) => p,
            None => return 0.0,
        };

        let iou = predicted.iou(&det.bbox);

        let gap = self
            .predictor
            .last_frame()
            .map(|last| frame_index.saturating_sub(last))
            .unwrap_or(1)
            .max(1) as f32;

        let size = predicted.width().max(predicted.height()).max(MIN_SPREAD);
        let spread = size * (1.0 + 0.05 * (gap - 1.0)).min(3.0);
        let proximity = 0.5 * math::gauss(math::distance(predicted.center(), det.bbox.center()), spread);

        iou.max(proximity)
    }

    /// Association cost, lower is better. Appearance only nudges the cost;
    /// the detection confidence breaks remaining ties.
    pub fn cost(
        &self,
        frame_index: u64,
        det: &Detection,
        signature: Option<&ColorSignature>,
        appearance_weight: f32,
    ) -> f32 {
        let motion = self.motion_score(frame_index, det);

        let appearance = match (self.appearance.as_ref(), signature) {
            (Some(a), Some(b)) => 1.0 - a.similarity(b),
            _ => 0.5,
        };

        (1.0 - motion) + appearance_weight * appearance - 1e-4 * det.confidence
    }

    pub fn update(&mut self, frame_index: u64, bbox: &BBox<Ltwh>, signature: Option<ColorSignature>) {
        self.predictor.update(frame_index, bbox);

        self.appearance = match (self.appearance, signature) {
            (Some(prev), Some(next)) => {
                let mut rgb = prev.rgb;
                for (c, n) in rgb.iter_mut().zip(next.rgb.iter()) {
                    *c = *c * (1.0 - APPEARANCE_EMA) + n * APPEARANCE_EMA;
                }
                Some(ColorSignature {
                    rgb,
                    purity: prev.purity * (1.0 - APPEARANCE_EMA) + next.purity * APPEARANCE_EMA,
                })
            }
            (None, next) => next,
            (prev, None) => prev,
        };
    }
}
