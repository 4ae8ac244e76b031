use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A single 2D point, in frame or screen pixels depending on context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation from `self` toward `target` by `t` in [0, 1].
    pub fn lerp(&self, target: Point, t: f32) -> Point {
        let t = t.clamp(0.0, 1.0);
        Point {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Clip this rect against a `width` x `height` frame. Returns `None` when
    /// nothing remains inside the frame.
    pub fn clipped(&self, width: u32, height: u32) -> Option<Rect> {
        let x0 = self.x.max(0.0);
        let y0 = self.y.max(0.0);
        let x1 = (self.x + self.width).min(width as f32);
        let y1 = (self.y + self.height).min(height as f32);
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// One camera frame: grayscale pixels plus capture metadata. Produced by a
/// `FrameSource`, consumed by exactly one detection pass.
#[derive(Debug, Clone)]
pub struct Frame {
    pub gray: GrayImage,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(gray: GrayImage, timestamp: Instant) -> Self {
        Self { gray, timestamp }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }
}

/// Face/eye regions found in one frame. Never outlives the detection pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionResult {
    pub face: Option<Rect>,
    pub left_eye: Option<Rect>,
    pub right_eye: Option<Rect>,
    pub face_found: bool,
    pub eyes_found: bool,
    /// True when the eye boxes were synthesized from the face geometry rather
    /// than detected.
    pub eyes_synthesized: bool,
}

/// Sub-pixel pupil center in frame space with a confidence score in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct PupilPosition {
    pub point: Point,
    pub confidence: f32,
}

impl PupilPosition {
    pub fn new(point: Point, confidence: f32) -> Self {
        Self { point, confidence }
    }
}

/// Per-frame output of the detection pipeline.
///
/// `raw` is the normalized pre-calibration gaze point in [0,1] x [0,1];
/// `smoothed` is filled in by the temporal stabilizer, in screen pixels.
#[derive(Debug, Clone, Copy)]
pub struct GazeSample {
    pub raw: Point,
    pub smoothed: Point,
    pub valid: bool,
    pub confidence: f32,
    pub timestamp: Instant,
}

impl GazeSample {
    pub fn invalid(timestamp: Instant) -> Self {
        Self {
            raw: Point::default(),
            smoothed: Point::default(),
            valid: false,
            confidence: 0.0,
            timestamp,
        }
    }
}

/// Published gaze state, written once per processed frame and read by
/// consumers at any time.
#[derive(Debug, Clone, Copy)]
pub struct GazeSnapshot {
    /// Normalized raw gaze point, pre-calibration.
    pub raw: Point,
    /// Stabilized point in screen pixels, pre-calibration.
    pub smoothed: Point,
    /// Final mapped point in screen pixels.
    pub screen: Point,
    pub is_valid: bool,
    pub is_calibrated: bool,
}

impl Default for GazeSnapshot {
    fn default() -> Self {
        Self {
            raw: Point::default(),
            smoothed: Point::default(),
            screen: Point::default(),
            is_valid: false,
            is_calibrated: false,
        }
    }
}
