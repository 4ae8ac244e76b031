use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Top-level configuration, persisted as `config.json` next to the binary.
///
/// Every section carries `#[serde(default)]` so fields added later pick up
/// their defaults when an older file is loaded; `load` saves the file back so
/// new fields materialize on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub screen: ScreenConfig,
    pub detection: DetectionConfig,
    pub pupil: PupilConfig,
    pub stabilizer: StabilizerConfig,
    pub fixation: FixationConfig,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    /// Requested capture size; 0 lets the camera pick its native format.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Flip the frame horizontally so on-screen left matches the user's left.
    pub mirror: bool,
    /// Run detection on a background thread.
    pub threaded: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 0,
            height: 0,
            fps: 30,
            mirror: true,
            threaded: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub width: f32,
    pub height: f32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 1920.0,
            height: 1080.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub face_model_path: String,
    /// Smallest face the cascade will report, in pixels.
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale_factor: f32,
    pub slide_window_step: u32,
    /// Fraction of the face box height searched for eyes, from the top.
    pub eye_band_fraction: f32,
    /// Eye candidate area bounds as fractions of the face area.
    pub eye_min_area_fraction: f32,
    pub eye_max_area_fraction: f32,
    /// Synthesize eye boxes from the face geometry when fewer than two eye
    /// candidates are found.
    pub use_face_center_fallback: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            face_model_path: "models/seeta_fd_frontal_v1.0.bin".to_string(),
            min_face_size: 40,
            score_threshold: 2.0,
            pyramid_scale_factor: 0.8,
            slide_window_step: 4,
            eye_band_fraction: 0.55,
            eye_min_area_fraction: 0.002,
            eye_max_area_fraction: 0.08,
            use_face_center_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PupilMode {
    /// Blur and take the darkest pixel. Fast, low precision.
    Basic,
    /// Contour-based detection with sub-pixel refinement.
    Precise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PupilConfig {
    pub mode: PupilMode,
    /// Contours rounder than this survive filtering (4*pi*A/P^2).
    pub min_circularity: f32,
    /// Half-size of the sub-pixel refinement neighborhood, in pixels.
    pub refine_radius: i32,
    /// Refinement may move the estimate at most this far.
    pub refine_max_shift: f32,
}

impl Default for PupilConfig {
    fn default() -> Self {
        Self {
            mode: PupilMode::Precise,
            min_circularity: 0.6,
            refine_radius: 3,
            refine_max_shift: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    /// Bounded history window, in samples.
    pub history_len: usize,
    /// Per-second lerp rate toward each new raw point.
    pub smoothing_factor: f32,
    /// Mean absolute deviation below this counts as stable, in screen pixels.
    pub stability_threshold_px: f32,
    /// Stability must hold continuously for this long, in seconds.
    pub stability_min_duration_s: f32,
    /// History samples farther than this from the rough mean are dropped when
    /// computing the robust mean, in screen pixels.
    pub outlier_distance_px: f32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            history_len: 20,
            smoothing_factor: 8.0,
            stability_threshold_px: 30.0,
            stability_min_duration_s: 0.5,
            outlier_distance_px: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixationConfig {
    /// Gaze staying within this radius counts toward a dwell, in pixels.
    pub radius_px: f32,
    /// Dwell duration that raises a fixation event, in seconds.
    pub dwell_s: f32,
}

impl Default for FixationConfig {
    fn default() -> Self {
        Self {
            radius_px: 80.0,
            dwell_s: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Margin of the 3x3 target grid from the screen edges, as a fraction of
    /// each screen dimension.
    pub margin_fraction: f32,
    /// Max wait for a stable gaze before collecting anyway, in seconds.
    pub stability_timeout_s: f32,
    /// Samples collected per target.
    pub samples_per_point: usize,
    /// Collection window per target, in seconds.
    pub collection_window_s: f32,
    /// Overall per-point budget before the point is degraded, in seconds.
    pub point_timeout_s: f32,
    /// Minimum consistent samples for a full-confidence observation.
    pub min_samples: usize,
    /// Samples farther than this multiple of the stability threshold from the
    /// running point mean are rejected.
    pub consistency_factor: f32,
    /// Fraction of samples kept (closest to the rough mean) by the robust
    /// average.
    pub trim_keep_fraction: f32,
    /// Clamp range for the fitted per-axis scale.
    pub scale_min: f32,
    pub scale_max: f32,
    /// Blend weight of the inverse-distance correction over the affine layer.
    pub local_blend: f32,
    /// Softening term in the inverse-distance weights, in squared pixels.
    pub idw_epsilon: f32,
    /// Directory holding the persisted calibration profile.
    pub profile_dir: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            margin_fraction: 0.08,
            stability_timeout_s: 10.0,
            samples_per_point: 12,
            collection_window_s: 2.0,
            point_timeout_s: 15.0,
            min_samples: 5,
            consistency_factor: 1.5,
            trim_keep_fraction: 0.7,
            scale_min: 0.2,
            scale_max: 5.0,
            local_blend: 0.7,
            idw_epsilon: 1.0,
            profile_dir: "calibration_data".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            screen: ScreenConfig::default(),
            detection: DetectionConfig::default(),
            pupil: PupilConfig::default(),
            stabilizer: StabilizerConfig::default(),
            fixation: FixationConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl AppConfig {
    pub const PATH: &'static str = "config.json";

    pub fn load() -> Result<Self> {
        Self::load_from(Self::PATH)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let config = if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match serde_json::from_str::<AppConfig>(&content) {
                Ok(c) => {
                    info!(path, "loaded configuration");
                    c
                }
                Err(e) => {
                    warn!(path, error = %e, "config parse failed, using defaults");
                    Self::default()
                }
            }
        } else {
            info!(path, "no configuration file, creating defaults");
            Self::default()
        };

        // Save back so newly added fields appear in the file.
        config.save_to(path)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::PATH)
    }

    pub fn save_to(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
