use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the gaze engine.
///
/// Only conditions a host needs to tell apart get a variant; everything else
/// travels as `anyhow::Error` at the application boundary.
#[derive(Error, Debug)]
pub enum GazeError {
    /// The face detection model is required; without it the whole subsystem
    /// is disabled.
    #[error("face detection model not found at {0:?}")]
    FaceModelMissing(PathBuf),

    #[error("failed to load face detection model from {path:?}: {message}")]
    FaceModelLoad { path: PathBuf, message: String },

    #[error("camera error: {0}")]
    Camera(String),

    #[error("calibration profile error: {0}")]
    Profile(String),
}
