use crate::config::{AppConfig, PupilMode};
use crate::detector::{FaceFinder, RegionDetector};
use crate::error::GazeError;
use crate::gaze;
use crate::pupil::PupilLocator;
use crate::types::{Frame, GazeSample};

/// Per-call pipeline switches, owned by the host and handed in with each
/// frame so they stay toggleable while detection runs on a worker thread.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub mirror: bool,
    pub pupil_mode: PupilMode,
}

/// The full per-frame detection chain: face/eye regions, pupil centers, raw
/// gaze point. One frame in, one `GazeSample` out; a frame that defeats
/// detection yields an invalid sample, never an error.
pub struct DetectionPipeline {
    detector: RegionDetector,
    locator: PupilLocator,
}

impl DetectionPipeline {
    pub fn new(config: &AppConfig) -> Result<Self, GazeError> {
        Ok(Self {
            detector: RegionDetector::new(&config.detection)?,
            locator: PupilLocator::new(&config.pupil),
        })
    }

    /// Pipeline with a custom face finder, for synthetic sources and tests.
    pub fn with_finder(config: &AppConfig, finder: Box<dyn FaceFinder>) -> Self {
        Self {
            detector: RegionDetector::with_finder(&config.detection, finder),
            locator: PupilLocator::new(&config.pupil),
        }
    }

    pub fn process(&mut self, frame: &Frame, settings: PipelineSettings) -> GazeSample {
        self.locator.set_mode(settings.pupil_mode);

        let region = self.detector.detect(frame);
        let (Some(left_rect), Some(right_rect)) = (region.left_eye, region.right_eye) else {
            // A sample is only valid with at least a face and a usable eye
            // pair (synthesized boxes count).
            return GazeSample::invalid(frame.timestamp);
        };

        let left = self.locator.locate(frame, left_rect);
        let right = self.locator.locate(frame, right_rect);

        let raw = gaze::estimate_raw(
            left,
            right,
            frame.width(),
            frame.height(),
            settings.mirror,
        );
        let confidence = gaze::sample_confidence(left, right, region.eyes_synthesized);

        GazeSample {
            raw,
            smoothed: raw,
            valid: true,
            confidence,
            timestamp: frame.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FixedRegionFinder;
    use crate::types::Rect;
    use image::GrayImage;
    use std::time::Instant;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            mirror: false,
            pupil_mode: PupilMode::Precise,
        }
    }

    fn face_frame_with_pupils() -> (Frame, Rect) {
        let mut gray = GrayImage::from_pixel(320, 320, image::Luma([180u8]));
        let face = Rect::new(60.0, 40.0, 200.0, 240.0);
        for y in 40..280 {
            for x in 60..260 {
                gray.put_pixel(x, y, image::Luma([160u8]));
            }
        }
        for (cx, cy) in [(120i32, 120i32), (200, 120)] {
            for dy in -6i32..=6 {
                for dx in -6i32..=6 {
                    if dx * dx + dy * dy <= 36 {
                        gray.put_pixel((cx + dx) as u32, (cy + dy) as u32, image::Luma([10u8]));
                    }
                }
            }
        }
        (Frame::new(gray, Instant::now()), face)
    }

    #[test]
    fn detected_pupils_make_a_valid_sample() {
        let (frame, face) = face_frame_with_pupils();
        let config = AppConfig::default();
        let mut pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));

        let sample = pipeline.process(&frame, settings());
        assert!(sample.valid);
        assert!(sample.confidence > 0.2);
        // Pupil midpoint is at (160, 120) in a 320x320 frame.
        assert!((sample.raw.x - 0.5).abs() < 0.05, "raw.x {}", sample.raw.x);
        assert!((sample.raw.y - 0.375).abs() < 0.05, "raw.y {}", sample.raw.y);
    }

    #[test]
    fn mirror_flips_raw_x() {
        let (frame, face) = face_frame_with_pupils();
        let config = AppConfig::default();
        let mut pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));

        let plain = pipeline.process(&frame, settings());
        let mirrored = pipeline.process(
            &frame,
            PipelineSettings {
                mirror: true,
                ..settings()
            },
        );
        assert!((mirrored.raw.x - (1.0 - plain.raw.x)).abs() < 1e-3);
    }

    #[test]
    fn no_face_is_invalid() {
        let (frame, _) = face_frame_with_pupils();
        let config = AppConfig::default();

        struct NoFace;
        impl FaceFinder for NoFace {
            fn find(&mut self, _gray: &GrayImage) -> Vec<(Rect, f32)> {
                Vec::new()
            }
        }

        let mut pipeline = DetectionPipeline::with_finder(&config, Box::new(NoFace));
        let sample = pipeline.process(&frame, settings());
        assert!(!sample.valid);
        assert_eq!(sample.confidence, 0.0);
    }

    #[test]
    fn face_without_eyes_falls_back_and_stays_valid() {
        // Face found, no dark blobs anywhere: the detector synthesizes eye
        // boxes and the sample stays valid at reduced confidence.
        let gray = GrayImage::from_pixel(320, 320, image::Luma([160u8]));
        let frame = Frame::new(gray, Instant::now());
        let face = Rect::new(60.0, 40.0, 200.0, 240.0);

        let config = AppConfig::default();
        let mut pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));

        let sample = pipeline.process(&frame, settings());
        assert!(sample.valid);
        assert!(sample.confidence > 0.0);
        assert!(sample.confidence < 0.2, "confidence {}", sample.confidence);
    }

    #[test]
    fn fallback_disabled_makes_eyeless_frames_invalid() {
        let gray = GrayImage::from_pixel(320, 320, image::Luma([160u8]));
        let frame = Frame::new(gray, Instant::now());
        let face = Rect::new(60.0, 40.0, 200.0, 240.0);

        let mut config = AppConfig::default();
        config.detection.use_face_center_fallback = false;
        let mut pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));

        let sample = pipeline.process(&frame, settings());
        assert!(!sample.valid);
    }
}
