use image::GrayImage;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

use crate::config::DetectionConfig;
use crate::error::GazeError;
use crate::types::{Frame, Rect, RegionResult};

/// Pluggable face detection backend. The cascade detector is the real one;
/// tests and the synthetic source pair with a fixed-region finder.
pub trait FaceFinder {
    /// Detect face rectangles with a confidence score, in frame pixels.
    fn find(&mut self, gray: &GrayImage) -> Vec<(Rect, f32)>;
}

/// Face finder backed by the `rustface` SeetaFace engine.
pub struct RustfaceFinder {
    detector: Box<dyn rustface::Detector>,
}

impl RustfaceFinder {
    pub fn new(config: &DetectionConfig) -> Result<Self, GazeError> {
        let path = Path::new(&config.face_model_path);
        if !path.exists() {
            return Err(GazeError::FaceModelMissing(path.to_path_buf()));
        }
        let bytes = fs::read(path).map_err(|e| GazeError::FaceModelLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let model = rustface::read_model(Cursor::new(bytes)).map_err(|e| {
            GazeError::FaceModelLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(config.min_face_size);
        detector.set_score_thresh(config.score_threshold);
        detector.set_pyramid_scale_factor(config.pyramid_scale_factor);
        detector.set_slide_window_step(config.slide_window_step, config.slide_window_step);

        info!(model = %config.face_model_path, "loaded face detection model");
        Ok(Self { detector })
    }
}

impl FaceFinder for RustfaceFinder {
    fn find(&mut self, gray: &GrayImage) -> Vec<(Rect, f32)> {
        let image = rustface::ImageData::new(gray.as_raw(), gray.width(), gray.height());
        self.detector
            .detect(&image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                (
                    Rect::new(
                        bbox.x() as f32,
                        bbox.y() as f32,
                        bbox.width() as f32,
                        bbox.height() as f32,
                    ),
                    face.score() as f32,
                )
            })
            .collect()
    }
}

/// Always reports one fixed face rectangle. Used with the synthetic frame
/// source and in tests, where no cascade model is available.
pub struct FixedRegionFinder {
    rect: Rect,
}

impl FixedRegionFinder {
    pub fn new(rect: Rect) -> Self {
        Self { rect }
    }
}

impl FaceFinder for FixedRegionFinder {
    fn find(&mut self, _gray: &GrayImage) -> Vec<(Rect, f32)> {
        vec![(self.rect, 10.0)]
    }
}

/// A dark connected component found in the eye band.
struct Blob {
    area: usize,
    min_x: u32,
    max_x: u32,
    min_y: u32,
    max_y: u32,
    sum_x: u64,
    sum_y: u64,
}

impl Blob {
    fn center_x(&self) -> f32 {
        self.sum_x as f32 / self.area as f32
    }

    fn center_y(&self) -> f32 {
        self.sum_y as f32 / self.area as f32
    }

    fn aspect(&self) -> f32 {
        let w = (self.max_x - self.min_x + 1) as f32;
        let h = (self.max_y - self.min_y + 1) as f32;
        w / h
    }
}

/// Finds the face region, then the eye regions within it. Falls back to
/// face-geometry eye boxes when eye detection comes up short and the fallback
/// is enabled.
pub struct RegionDetector {
    finder: Box<dyn FaceFinder>,
    config: DetectionConfig,
}

impl RegionDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self, GazeError> {
        let finder = Box::new(RustfaceFinder::new(config)?);
        Ok(Self::with_finder(config, finder))
    }

    pub fn with_finder(config: &DetectionConfig, finder: Box<dyn FaceFinder>) -> Self {
        Self {
            finder,
            config: config.clone(),
        }
    }

    pub fn detect(&mut self, frame: &Frame) -> RegionResult {
        let faces = self.finder.find(&frame.gray);
        let face = faces
            .into_iter()
            .max_by(|a, b| {
                a.0.area()
                    .partial_cmp(&b.0.area())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(rect, _)| rect)
            .and_then(|rect| rect.clipped(frame.width(), frame.height()));

        let Some(face) = face else {
            return RegionResult::default();
        };

        let mut result = RegionResult {
            face: Some(face),
            face_found: true,
            ..RegionResult::default()
        };

        match self.find_eyes(&frame.gray, face) {
            Some((left, right)) => {
                result.left_eye = left.clipped(frame.width(), frame.height());
                result.right_eye = right.clipped(frame.width(), frame.height());
                result.eyes_found = result.left_eye.is_some() && result.right_eye.is_some();
            }
            None => {
                if self.config.use_face_center_fallback {
                    let (left, right) = Self::fallback_eyes(face);
                    debug!("eye detection failed, synthesizing boxes from face geometry");
                    result.left_eye = left.clipped(frame.width(), frame.height());
                    result.right_eye = right.clipped(frame.width(), frame.height());
                    result.eyes_found = result.left_eye.is_some() && result.right_eye.is_some();
                    result.eyes_synthesized = result.eyes_found;
                }
            }
        }

        result
    }

    /// Scan the upper band of the face box for two dark blobs. Returns eye
    /// boxes ordered left/right by x, or `None` when fewer than two plausible
    /// candidates exist.
    fn find_eyes(&self, gray: &GrayImage, face: Rect) -> Option<(Rect, Rect)> {
        let band = Rect::new(
            face.x,
            face.y,
            face.width,
            face.height * self.config.eye_band_fraction,
        )
        .clipped(gray.width(), gray.height())?;

        let x0 = band.x as u32;
        let y0 = band.y as u32;
        let bw = band.width as u32;
        let bh = band.height as u32;
        if bw < 4 || bh < 4 {
            return None;
        }

        // Band-local adaptive threshold: anything well below the band mean
        // counts as dark.
        let mut sum: u64 = 0;
        for y in 0..bh {
            for x in 0..bw {
                sum += gray.get_pixel(x0 + x, y0 + y)[0] as u64;
            }
        }
        let mean = sum as f32 / (bw * bh) as f32;
        let threshold = (mean * 0.6) as u8;

        let blobs = extract_blobs(gray, x0, y0, bw, bh, threshold);

        let min_area = (face.area() * self.config.eye_min_area_fraction) as usize;
        let max_area = (face.area() * self.config.eye_max_area_fraction) as usize;
        let mut candidates: Vec<Blob> = blobs
            .into_iter()
            .filter(|b| b.area >= min_area.max(4) && b.area <= max_area)
            .filter(|b| {
                let aspect = b.aspect();
                (0.4..=3.5).contains(&aspect)
            })
            .collect();

        if candidates.len() < 2 {
            return None;
        }

        // More than two candidates: the two largest by area win.
        candidates.sort_by(|a, b| b.area.cmp(&a.area));
        candidates.truncate(2);
        candidates.sort_by(|a, b| {
            a.center_x()
                .partial_cmp(&b.center_x())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Two blobs on top of each other are not a pair of eyes.
        if (candidates[1].center_x() - candidates[0].center_x()).abs() < face.width * 0.15 {
            return None;
        }

        let eye_w = face.width * 0.30;
        let eye_h = face.height * 0.22;
        let boxed = |blob: &Blob| {
            Rect::new(
                blob.center_x() - eye_w / 2.0,
                blob.center_y() - eye_h / 2.0,
                eye_w,
                eye_h,
            )
        };
        Some((boxed(&candidates[0]), boxed(&candidates[1])))
    }

    /// Eye boxes synthesized as fixed offsets from the face center.
    fn fallback_eyes(face: Rect) -> (Rect, Rect) {
        let eye_w = face.width * 0.30;
        let eye_h = face.height * 0.22;
        let cy = face.y + face.height * 0.38;
        let left_cx = face.x + face.width * 0.30;
        let right_cx = face.x + face.width * 0.70;
        (
            Rect::new(left_cx - eye_w / 2.0, cy - eye_h / 2.0, eye_w, eye_h),
            Rect::new(right_cx - eye_w / 2.0, cy - eye_h / 2.0, eye_w, eye_h),
        )
    }
}

/// 4-connected component labeling of pixels darker than `threshold` inside
/// the given band.
fn extract_blobs(
    gray: &GrayImage,
    x0: u32,
    y0: u32,
    width: u32,
    height: u32,
    threshold: u8,
) -> Vec<Blob> {
    let mask = |x: u32, y: u32| gray.get_pixel(x0 + x, y0 + y)[0] < threshold;
    let mut visited = vec![false; (width * height) as usize];
    let mut blobs = Vec::new();

    for start_y in 0..height {
        for start_x in 0..width {
            let idx = (start_y * width + start_x) as usize;
            if visited[idx] || !mask(start_x, start_y) {
                continue;
            }

            let mut blob = Blob {
                area: 0,
                min_x: start_x,
                max_x: start_x,
                min_y: start_y,
                max_y: start_y,
                sum_x: 0,
                sum_y: 0,
            };
            let mut stack = vec![(start_x, start_y)];
            visited[idx] = true;

            while let Some((x, y)) = stack.pop() {
                blob.area += 1;
                blob.min_x = blob.min_x.min(x);
                blob.max_x = blob.max_x.max(x);
                blob.min_y = blob.min_y.min(y);
                blob.max_y = blob.max_y.max(y);
                blob.sum_x += (x0 + x) as u64;
                blob.sum_y += (y0 + y) as u64;

                let neighbors = [
                    (x.wrapping_sub(1), y),
                    (x + 1, y),
                    (x, y.wrapping_sub(1)),
                    (x, y + 1),
                ];
                for (nx, ny) in neighbors {
                    if nx < width && ny < height {
                        let nidx = (ny * width + nx) as usize;
                        if !visited[nidx] && mask(nx, ny) {
                            visited[nidx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            blobs.push(blob);
        }
    }

    blobs
}
