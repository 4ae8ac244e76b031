//! Webcam gaze estimation and calibration engine.
//!
//! The pipeline runs face detection, eye-region search, and pupil
//! localization over camera frames, stabilizes the resulting gaze point over
//! time, and maps it through a 9-point calibration model to a screen
//! coordinate. The host application consumes a [`types::GazeSnapshot`] per
//! frame plus calibration and fixation events; everything else (rendering,
//! pet behavior, UI) lives outside this crate.

pub mod calibration;
pub mod camera;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod gaze;
pub mod mapper;
pub mod pipeline;
pub mod pupil;
pub mod stabilizer;
pub mod types;

pub use calibration::{
    CalibrationEngine, CalibrationEvent, CalibrationModel, CalibrationPhase, QualityRating,
    QualityReport,
};
pub use camera::{CameraSource, FrameSource, SyntheticSource};
pub use config::AppConfig;
pub use engine::{GazeEngine, GazeEvent, GazeState};
pub use error::GazeError;
pub use types::{GazeSample, GazeSnapshot, Point, Rect};
