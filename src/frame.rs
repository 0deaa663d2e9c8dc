use ndarray::prelude::*;

use crate::bbox::{BBox, Ltwh};
use crate::error::Error;

/// A decoded video frame. Pixels are RGB, laid out as (height, width, channel).
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f32, // in seconds
    pub pixels: Array3<u8>,
}

impl Frame {
    pub fn new(index: u64, timestamp: f32, pixels: Array3<u8>) -> Self {
        Self {
            index,
            timestamp,
            pixels,
        }
    }

    /// Rejects buffers that are not non-empty RGB.
    pub fn validate(&self) -> Result<(), Error> {
        let shape = self.pixels.shape();

        if shape[2] != 3 {
            return Err(Error::Source(format!(
                "frame {} has {} channels, expected 3",
                self.index, shape[2]
            )));
        }

        if shape[0] == 0 || shape[1] == 0 {
            return Err(Error::Source(format!("frame {} has no pixels", self.index)));
        }

        Ok(())
    }

    /// (width, height)
    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        let shape = self.pixels.shape();
        (shape[1], shape[0])
    }

    /// Clamps a box to the frame and returns integer pixel bounds (x0, y0, x1, y1).
    pub fn clamp_box(&self, bbox: &BBox<Ltwh>) -> Option<(usize, usize, usize, usize)> {
        let (fw, fh) = self.dims();
        let ltrb = bbox.as_ltrb();

        let x0 = ltrb.left().max(0.0).floor() as usize;
        let y0 = ltrb.top().max(0.0).floor() as usize;
        let x1 = (ltrb.right().max(0.0).ceil() as usize).min(fw);
        let y1 = (ltrb.bottom().max(0.0).ceil() as usize).min(fh);

        if x1 <= x0 || y1 <= y0 {
            None
        } else {
            Some((x0, y0, x1, y1))
        }
    }

    /// Pixel region covered by `bbox`, or `None` if it falls outside the frame.
    pub fn crop(&self, bbox: &BBox<Ltwh>) -> Option<ArrayView3<'_, u8>> {
        let (x0, y0, x1, y1) = self.clamp_box(bbox)?;

        Some(self.pixels.slice(s![y0..y1, x0..x1, ..]))
    }

    /// Luma plane (ITU-R BT.601) as floats.
    pub fn gray(&self) -> Array2<f32> {
        let (w, h) = self.dims();

        Array2::from_shape_fn((h, w), |(y, x)| {
            0.299 * self.pixels[[y, x, 0]] as f32
                + 0.587 * self.pixels[[y, x, 1]] as f32
                + 0.114 * self.pixels[[y, x, 2]] as f32
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_is_clamped_to_frame() {
        let frame = Frame::new(0, 0.0, Array3::zeros((40, 60, 3)));
        let crop = frame.crop(&BBox::ltwh(50.0, 30.0, 20.0, 20.0)).unwrap();
        assert_eq!(crop.shape(), &[10, 10, 3]);

        assert!(frame.crop(&BBox::ltwh(100.0, 100.0, 5.0, 5.0)).is_none());
    }

    #[test]
    fn only_rgb_frames_are_valid() {
        assert!(Frame::new(0, 0.0, Array3::zeros((4, 4, 3))).validate().is_ok());

        let gray = Frame::new(7, 0.0, Array3::zeros((4, 4, 1)));
        assert!(matches!(gray.validate(), Err(Error::Source(msg)) if msg.contains("frame 7")));

        assert!(Frame::new(0, 0.0, Array3::zeros((0, 4, 3))).validate().is_err());
    }

    #[test]
    fn gray_of_white_is_255() {
        let frame = Frame::new(0, 0.0, Array3::from_elem((2, 2, 3), 255));
        let gray = frame.gray();
        assert!((gray[[1, 1]] - 255.0).abs() < 0.01);
    }
}
