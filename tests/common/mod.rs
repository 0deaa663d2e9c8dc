#![allow(dead_code)]

use ndarray::{s, Array3};
use std::collections::HashMap;
use std::sync::mpsc;

use pitchtrack::{DetectError, Detector, Error, Frame, FrameSource, RawDetection};

pub const FPS: f32 = 25.0;
pub const GRASS: [u8; 3] = [40, 140, 40];

pub fn flat_frames(n: u64, width: usize, height: usize) -> Vec<Frame> {
    (0..n)
        .map(|i| Frame::new(i, i as f32 / FPS, Array3::from_elem((height, width, 3), 90)))
        .collect()
}

/// Like `flat_frames`, but frames are built as the pipeline pulls them.
pub fn flat_stream(n: u64, width: usize, height: usize) -> impl Iterator<Item = Frame> + Send {
    (0..n).map(move |i| Frame::new(i, i as f32 / FPS, Array3::from_elem((height, width, 3), 90)))
}

pub fn grass(width: usize, height: usize) -> Array3<u8> {
    Array3::from_shape_fn((height, width, 3), |(_, _, c)| GRASS[c])
}

pub fn paint(pixels: &mut Array3<u8>, left: usize, top: usize, w: usize, h: usize, rgb: [u8; 3]) {
    for (c, v) in rgb.iter().enumerate() {
        pixels.slice_mut(s![top..top + h, left..left + w, c]).fill(*v);
    }
}

pub fn raw(class: &str, x: f32, y: f32, w: f32, h: f32) -> RawDetection {
    RawDetection {
        x,
        y,
        w,
        h,
        confidence: 0.9,
        class: class.into(),
    }
}

/// Detector replaying a fixed list of detections per frame.
#[derive(Default)]
pub struct Script {
    frames: HashMap<u64, Vec<RawDetection>>,
}

impl Script {
    pub fn push(&mut self, frame_index: u64, det: RawDetection) {
        self.frames.entry(frame_index).or_default().push(det);
    }
}

impl Detector for Script {
    fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectError> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}

/// Source that blocks until the test hands it a frame.
pub struct ChannelSource(pub mpsc::Receiver<Frame>);

impl FrameSource for ChannelSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        Ok(self.0.recv().ok())
    }

    fn fps(&self) -> Option<f32> {
        Some(FPS)
    }
}

pub const COLS: usize = 10;
pub const ROWS: usize = 5;
pub const KIT_W: usize = 24;
pub const KIT_H: usize = 48;

pub fn slot(i: usize) -> (usize, usize) {
    (20 + (i % COLS) * 60, 20 + (i / COLS) * 75)
}

/// Kit of the player standing in slot `i`: red for even slots, blue for odd.
pub fn kit(i: usize) -> usize {
    i % 2
}

pub fn kit_color(i: usize) -> [u8; 3] {
    let j = (i * 7 % 30) as u8;
    match kit(i) {
        0 => [200 + j, 30, 30],
        _ => [30, 40 + j, 200],
    }
}

/// Fifty stationary players in two kits, plus a ball rolling along the top row.
pub fn match_scene(frames: u64) -> (Vec<Frame>, Script) {
    let (width, height) = (640, 400);
    let mut script = Script::default();
    let mut out = Vec::new();

    let mut base = grass(width, height);
    for i in 0..COLS * ROWS {
        let (left, top) = slot(i);
        paint(&mut base, left, top, KIT_W, KIT_H, kit_color(i));
    }

    for f in 0..frames {
        let mut pixels = base.clone();

        for i in 0..COLS * ROWS {
            let (left, top) = slot(i);
            script.push(f, raw("player", left as f32, top as f32, KIT_W as f32, KIT_H as f32));
        }

        let bx = 30 + (f as usize * 3) % 500;
        let by = 20 + KIT_H + 4;
        paint(&mut pixels, bx, by, 6, 6, [250, 250, 250]);
        script.push(f, raw("ball", bx as f32, by as f32, 6.0, 6.0));

        out.push(Frame::new(f, f as f32 / FPS, pixels));
    }

    (out, script)
}
