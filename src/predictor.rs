use super::math::linear_ls;
use crate::bbox::{BBox, Ltwh};
use nalgebra as na;
use std::collections::VecDeque;

/// Short-horizon constant-velocity model over the last few observed box centers.
#[derive(Debug, Clone)]
pub struct Predictor {
    horizon: usize,
    observations: VecDeque<(u64, na::Point2<f32>)>,
    size: (f32, f32),
    velocity: na::Vector2<f32>,
}

impl Predictor {
    pub fn new(horizon: usize, bbox: &BBox<Ltwh>, frame_index: u64) -> Self {
        let mut predictor = Self {
            horizon: horizon.max(2),
            observations: VecDeque::with_capacity(horizon.max(2)),
            size: (bbox.width(), bbox.height()),
            velocity: na::Vector2::zeros(),
        };

        predictor.update(frame_index, bbox);
        predictor
    }

    pub fn update(&mut self, frame_index: u64, bbox: &BBox<Ltwh>) {
        if self.observations.len() == self.horizon {
            self.observations.pop_front();
        }

        self.observations.push_back((frame_index, bbox.center()));
        self.size = (bbox.width(), bbox.height());
        self.velocity = self.fit_velocity();
    }

    // pixels per frame
    fn fit_velocity(&self) -> na::Vector2<f32> {
        let (last_index, _) = match self.observations.back() {
            Some(last) => *last,
            None => return na::Vector2::zeros(),
        };

        if self.observations.len() < 2 {
            return na::Vector2::zeros();
        }

        // relative frame offsets keep the normal equations well conditioned
        let t: Vec<f32> = self
            .observations
            .iter()
            .map(|(idx, _)| *idx as f32 - last_index as f32)
            .collect();
        let xs: Vec<f32> = self.observations.iter().map(|(_, p)| p.x).collect();
        let ys: Vec<f32> = self.observations.iter().map(|(_, p)| p.y).collect();

        match (linear_ls(&t, &xs), linear_ls(&t, &ys)) {
            (Some(fx), Some(fy)) => na::Vector2::new(fx[0], fy[0]),
            _ => na::Vector2::zeros(),
        }
    }

    #[inline]
    pub fn last_frame(&self) -> Option<u64> {
        self.observations.back().map(|(idx, _)| *idx)
    }

    /// Expected center at `frame_index`.
    pub fn predict_center(&self, frame_index: u64) -> Option<na::Point2<f32>> {
        let (last_index, last) = *self.observations.back()?;
        let dt = frame_index.saturating_sub(last_index) as f32;

        Some(last + self.velocity * dt)
    }

    /// Expected box at `frame_index`, keeping the last observed size.
    pub fn predict(&self, frame_index: u64) -> Option<BBox<Ltwh>> {
        let c = self.predict_center(frame_index)?;
        let (w, h) = self.size;

        Some(BBox::ltwh(c.x - w / 2.0, c.y - h / 2.0, w, h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f32, y: f32) -> BBox<Ltwh> {
        BBox::ltwh(x, y, 10.0, 20.0)
    }

    #[test]
    fn single_observation_predicts_stationary() {
        let p = Predictor::new(3, &at(100.0, 50.0), 0);
        let pred = p.predict(10).unwrap();
        assert_eq!((pred.left(), pred.top()), (100.0, 50.0));
    }

    #[test]
    fn extrapolates_constant_velocity_over_gaps() {
        let mut p = Predictor::new(3, &at(0.0, 0.0), 0);
        p.update(1, &at(2.0, 1.0));
        p.update(2, &at(4.0, 2.0));

        let pred = p.predict(12).unwrap();
        assert!((pred.left() - 24.0).abs() < 1e-2);
        assert!((pred.top() - 12.0).abs() < 1e-2);
    }

    #[test]
    fn horizon_forgets_old_motion() {
        let mut p = Predictor::new(2, &at(0.0, 0.0), 0);
        p.update(1, &at(10.0, 0.0));
        p.update(2, &at(10.0, 0.0));
        let pred = p.predict(6).unwrap();
        assert!((pred.left() - 10.0).abs() < 1e-3);
    }
}
