use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{CalibrationConfig, ScreenConfig, StabilizerConfig};
use crate::stabilizer::TemporalStabilizer;
use crate::types::Point;

pub const TARGET_COUNT: usize = 9;

/// The 9 fixed calibration targets: a 3x3 grid inset from the screen edges
/// by the configured margin. Row-major, index 0 top-left, 8 bottom-right.
pub fn target_grid(screen: &ScreenConfig, margin_fraction: f32) -> [Point; TARGET_COUNT] {
    let mx = screen.width * margin_fraction;
    let my = screen.height * margin_fraction;
    let xs = [mx, screen.width / 2.0, screen.width - mx];
    let ys = [my, screen.height / 2.0, screen.height - my];

    let mut targets = [Point::default(); TARGET_COUNT];
    for (i, target) in targets.iter_mut().enumerate() {
        *target = Point::new(xs[i % 3], ys[i / 3]);
    }
    targets
}

// =========================================================================
// Observations & model
// =========================================================================

/// Everything recorded for one calibration target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub target_index: usize,
    /// Raw stabilized samples collected while the user fixated the target,
    /// in screen pixels.
    pub samples: Vec<Point>,
    /// Robust average of the samples.
    pub observed: Point,
    /// Per-point quality in [0, 1]; low for degraded observations.
    pub confidence: f32,
    /// True when the point timed out and was recorded from the last known
    /// stabilized position instead of a full sample set.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityRating {
    Excellent,
    Acceptable,
    /// Re-calibration recommended. Advisory; the model is still installed.
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub mean_error_px: f32,
    pub max_error_px: f32,
    pub rating: QualityRating,
}

/// The fitted mapping from raw gaze space to screen space: a global affine
/// component plus the observations backing the localized inverse-distance
/// correction. Immutable once fit; re-calibration replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationModel {
    /// Affine offset in normalized [0,1] screen space.
    pub offset: Point,
    /// Per-axis affine scale, clamped to the configured range at fit time.
    pub scale: Point,
    pub observations: Vec<CalibrationObservation>,
    /// Screen-pixel targets the observations correspond to, by index.
    pub targets: Vec<Point>,
    pub screen_width: f32,
    pub screen_height: f32,
}

impl CalibrationModel {
    /// Fit the affine layer from 9 observations: a confidence-weighted
    /// per-axis least-squares line from observed to target in normalized
    /// space. The scale is clamped to the configured range, then the offset
    /// is refit against the clamped scale so a clamp shifts rather than
    /// skews the result.
    pub fn fit(
        observations: Vec<CalibrationObservation>,
        targets: &[Point; TARGET_COUNT],
        screen: &ScreenConfig,
        config: &CalibrationConfig,
    ) -> Self {
        debug_assert_eq!(observations.len(), TARGET_COUNT);

        let norm = |p: Point| Point::new(p.x / screen.width, p.y / screen.height);

        let mut weight_sum = 0.0;
        let mut mean_o = Point::default();
        let mut mean_t = Point::default();
        for obs in &observations {
            let w = obs.confidence.max(0.05);
            let o = norm(obs.observed);
            let t = norm(targets[obs.target_index]);
            mean_o.x += w * o.x;
            mean_o.y += w * o.y;
            mean_t.x += w * t.x;
            mean_t.y += w * t.y;
            weight_sum += w;
        }
        mean_o.x /= weight_sum;
        mean_o.y /= weight_sum;
        mean_t.x /= weight_sum;
        mean_t.y /= weight_sum;

        let mut cov = Point::default();
        let mut var = Point::default();
        for obs in &observations {
            let w = obs.confidence.max(0.05);
            let o = norm(obs.observed);
            let t = norm(targets[obs.target_index]);
            cov.x += w * (o.x - mean_o.x) * (t.x - mean_t.x);
            cov.y += w * (o.y - mean_o.y) * (t.y - mean_t.y);
            var.x += w * (o.x - mean_o.x) * (o.x - mean_o.x);
            var.y += w * (o.y - mean_o.y) * (o.y - mean_o.y);
        }

        // Degenerate spread (all observations on one line) falls back to a
        // unit scale; the offset still centers the cloud on the targets.
        let axis_scale = |cov: f32, var: f32| {
            if var < 1e-6 {
                1.0
            } else {
                cov / var
            }
        };
        let scale = Point::new(
            axis_scale(cov.x, var.x).clamp(config.scale_min, config.scale_max),
            axis_scale(cov.y, var.y).clamp(config.scale_min, config.scale_max),
        );
        let offset = Point::new(
            mean_t.x - mean_o.x * scale.x,
            mean_t.y - mean_o.y * scale.y,
        );

        Self {
            offset,
            scale,
            observations,
            targets: targets.to_vec(),
            screen_width: screen.width,
            screen_height: screen.height,
        }
    }

    /// Apply only the affine layer. Screen pixels in, screen pixels out.
    pub fn affine_apply(&self, raw: Point) -> Point {
        let nx = raw.x / self.screen_width;
        let ny = raw.y / self.screen_height;
        Point::new(
            (nx * self.scale.x + self.offset.x) * self.screen_width,
            (ny * self.scale.y + self.offset.y) * self.screen_height,
        )
    }

    /// Affine-only residuals against the original targets.
    pub fn quality(&self) -> QualityReport {
        let mut total = 0.0;
        let mut max = 0.0f32;
        for obs in &self.observations {
            let residual = self
                .affine_apply(obs.observed)
                .distance(self.targets[obs.target_index]);
            total += residual;
            max = max.max(residual);
        }
        let mean = total / self.observations.len() as f32;
        let rating = if mean < 60.0 {
            QualityRating::Excellent
        } else if mean < 140.0 {
            QualityRating::Acceptable
        } else {
            QualityRating::Poor
        };
        QualityReport {
            mean_error_px: mean,
            max_error_px: max,
            rating,
        }
    }
}

/// Robust average: plain mean for three or fewer samples; otherwise sort by
/// distance to the rough mean, keep the closest fraction, and average those.
pub fn robust_average(samples: &[Point], keep_fraction: f32) -> Point {
    let mean = |pts: &[&Point]| {
        let n = pts.len() as f32;
        Point::new(
            pts.iter().map(|p| p.x).sum::<f32>() / n,
            pts.iter().map(|p| p.y).sum::<f32>() / n,
        )
    };

    let all: Vec<&Point> = samples.iter().collect();
    let rough = mean(&all);
    if samples.len() <= 3 {
        return rough;
    }

    let mut by_distance: Vec<&Point> = samples.iter().collect();
    by_distance.sort_by(|a, b| {
        a.distance(rough)
            .partial_cmp(&b.distance(rough))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let keep = ((samples.len() as f32 * keep_fraction).ceil() as usize)
        .clamp(3, samples.len());
    mean(&by_distance[..keep])
}

// =========================================================================
// Protocol state machine
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    WaitingForStability(usize),
    Collecting(usize),
    Calibrated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Started,
    PointRecorded {
        index: usize,
        observed: Point,
        target: Point,
        residual: f32,
    },
    Completed(QualityReport),
    Cancelled,
}

enum State {
    Idle,
    WaitingForStability {
        index: usize,
        since: Instant,
        point_started: Instant,
    },
    Collecting {
        index: usize,
        point_started: Instant,
        last_sample: Option<Instant>,
        samples: Vec<Point>,
    },
}

/// Guided 9-point calibration protocol. Driven by `tick` from the main loop;
/// consumes stabilized points and produces the `CalibrationModel` used by the
/// coordinate mapper.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    screen: ScreenConfig,
    targets: [Point; TARGET_COUNT],
    /// Sample consistency radius, derived from the stabilizer threshold.
    consistency_radius: f32,
    state: State,
    observations: Vec<CalibrationObservation>,
    model: Option<CalibrationModel>,
    events: VecDeque<CalibrationEvent>,
}

impl CalibrationEngine {
    pub fn new(
        config: &CalibrationConfig,
        stabilizer: &StabilizerConfig,
        screen: &ScreenConfig,
    ) -> Self {
        Self {
            config: config.clone(),
            screen: screen.clone(),
            targets: target_grid(screen, config.margin_fraction),
            consistency_radius: config.consistency_factor * stabilizer.stability_threshold_px,
            state: State::Idle,
            observations: Vec::new(),
            model: None,
            events: VecDeque::new(),
        }
    }

    pub fn targets(&self) -> &[Point; TARGET_COUNT] {
        &self.targets
    }

    pub fn model(&self) -> Option<&CalibrationModel> {
        self.model.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn phase(&self) -> CalibrationPhase {
        match &self.state {
            State::Idle if self.model.is_some() => CalibrationPhase::Calibrated,
            State::Idle => CalibrationPhase::Idle,
            State::WaitingForStability { index, .. } => {
                CalibrationPhase::WaitingForStability(*index)
            }
            State::Collecting { index, .. } => CalibrationPhase::Collecting(*index),
        }
    }

    /// The target the user should be fixating right now, if the protocol is
    /// running.
    pub fn current_target(&self) -> Option<(usize, Point)> {
        match &self.state {
            State::Idle => None,
            State::WaitingForStability { index, .. } | State::Collecting { index, .. } => {
                Some((*index, self.targets[*index]))
            }
        }
    }

    pub fn drain_events(&mut self) -> Vec<CalibrationEvent> {
        self.events.drain(..).collect()
    }

    /// Begin the protocol at target 0. Any in-progress observations are
    /// discarded; the installed model stays until a new fit replaces it.
    pub fn start(&mut self, now: Instant) {
        self.observations.clear();
        self.state = State::WaitingForStability {
            index: 0,
            since: now,
            point_started: now,
        };
        self.events.push_back(CalibrationEvent::Started);
        info!("calibration started");
    }

    /// Abort without touching the installed model.
    pub fn cancel(&mut self) {
        if self.is_running() {
            self.state = State::Idle;
            self.observations.clear();
            self.events.push_back(CalibrationEvent::Cancelled);
            info!("calibration cancelled");
        }
    }

    /// Drop the installed model entirely.
    pub fn reset(&mut self) {
        self.model = None;
        info!("calibration model cleared");
    }

    /// Install a previously fitted model, e.g. one loaded from disk.
    pub fn install(&mut self, model: CalibrationModel) {
        self.model = Some(model);
    }

    /// Host nudge: skip the stability wait, or finalize the current point
    /// immediately with whatever has been gathered.
    pub fn record_point(&mut self, now: Instant, stabilizer: &TemporalStabilizer) {
        match &self.state {
            State::WaitingForStability { .. } => self.begin_collecting(),
            State::Collecting { .. } => self.finalize_current(now, stabilizer),
            State::Idle => {}
        }
    }

    /// Advance the protocol. Call once per processed frame.
    pub fn tick(&mut self, now: Instant, stabilizer: &TemporalStabilizer) {
        enum Transition {
            None,
            BeginCollecting,
            Finalize,
        }

        let transition = match &mut self.state {
            State::Idle => Transition::None,
            State::WaitingForStability { index, since, .. } => {
                let timed_out = now.saturating_duration_since(*since)
                    >= Duration::from_secs_f32(self.config.stability_timeout_s);
                if stabilizer.is_stable(now) || timed_out {
                    if timed_out {
                        warn!(index = *index, "stability wait timed out, collecting anyway");
                    }
                    Transition::BeginCollecting
                } else {
                    Transition::None
                }
            }
            State::Collecting {
                point_started,
                last_sample,
                samples,
                ..
            } => {
                let interval = Duration::from_secs_f32(
                    self.config.collection_window_s / self.config.samples_per_point.max(1) as f32,
                );
                let due = last_sample
                    .map(|t| now.saturating_duration_since(t) >= interval)
                    .unwrap_or(true);

                if due {
                    if let Some(candidate) = stabilizer.robust_mean() {
                        // Point-local outlier filter, distinct from the
                        // stabilizer's: a sample must agree with the running
                        // mean of this target's samples.
                        let consistent = if samples.is_empty() {
                            true
                        } else {
                            let mean = robust_average(samples, 1.0);
                            candidate.distance(mean) <= self.consistency_radius
                        };
                        if consistent {
                            samples.push(candidate);
                            *last_sample = Some(now);
                        }
                    }
                }

                let have_all = samples.len() >= self.config.samples_per_point;
                let timed_out = now.saturating_duration_since(*point_started)
                    >= Duration::from_secs_f32(self.config.point_timeout_s);
                if have_all || timed_out {
                    Transition::Finalize
                } else {
                    Transition::None
                }
            }
        };

        match transition {
            Transition::None => {}
            Transition::BeginCollecting => self.begin_collecting(),
            Transition::Finalize => self.finalize_current(now, stabilizer),
        }
    }

    fn begin_collecting(&mut self) {
        if let State::WaitingForStability {
            index,
            point_started,
            ..
        } = &self.state
        {
            let (index, point_started) = (*index, *point_started);
            self.state = State::Collecting {
                index,
                point_started,
                last_sample: None,
                samples: Vec::new(),
            };
        }
    }

    /// Turn the gathered samples into an observation, emit the point event,
    /// and either advance to the next target or fit the model. The protocol
    /// always produces exactly 9 observations; a starved point is recorded
    /// degraded, never dropped.
    fn finalize_current(&mut self, now: Instant, stabilizer: &TemporalStabilizer) {
        let State::Collecting { index, samples, .. } = &self.state else {
            return;
        };
        let index = *index;
        let samples = samples.clone();
        let target = self.targets[index];

        let observation = if samples.len() >= self.config.min_samples {
            let observed = robust_average(&samples, self.config.trim_keep_fraction);
            let spread = samples
                .iter()
                .map(|s| s.distance(observed))
                .sum::<f32>()
                / samples.len() as f32;
            let confidence =
                (1.0 - spread / (2.0 * self.consistency_radius)).clamp(0.2, 1.0);
            CalibrationObservation {
                target_index: index,
                samples,
                observed,
                confidence,
                degraded: false,
            }
        } else {
            // Starved point: fall back to the last known stabilized position.
            let observed = stabilizer
                .robust_mean()
                .or_else(|| stabilizer.smoothed())
                .or_else(|| samples.last().copied())
                .unwrap_or(target);
            warn!(
                index,
                collected = samples.len(),
                "point starved, recording degraded observation"
            );
            CalibrationObservation {
                target_index: index,
                samples,
                observed,
                confidence: 0.1,
                degraded: true,
            }
        };

        let residual = observation.observed.distance(target);
        self.events.push_back(CalibrationEvent::PointRecorded {
            index,
            observed: observation.observed,
            target,
            residual,
        });
        info!(index, residual, "calibration point recorded");
        self.observations.push(observation);

        if index + 1 < TARGET_COUNT {
            self.state = State::WaitingForStability {
                index: index + 1,
                since: now,
                point_started: now,
            };
        } else {
            let observations = std::mem::take(&mut self.observations);
            let model =
                CalibrationModel::fit(observations, &self.targets, &self.screen, &self.config);
            let quality = model.quality();
            info!(
                mean_error_px = quality.mean_error_px,
                max_error_px = quality.max_error_px,
                rating = ?quality.rating,
                "calibration complete"
            );
            self.model = Some(model);
            self.state = State::Idle;
            self.events
                .push_back(CalibrationEvent::Completed(quality));
        }
    }
}

// =========================================================================
// Profile persistence
// =========================================================================

/// On-disk calibration profile. Round-trips the model losslessly so a
/// reloaded profile reproduces identical mapping behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub saved_at: String,
    pub quality: QualityReport,
    pub model: CalibrationModel,
}

/// Loads and saves the calibration profile under a data directory, the same
/// way the rest of the app persists JSON.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: &str) -> Result<Self> {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).context("failed to create calibration data directory")?;
        }
        Ok(Self {
            path: Path::new(dir).join("calibration.json"),
        })
    }

    pub fn load(&self) -> Option<CalibrationModel> {
        if !self.path.exists() {
            return None;
        }
        let content = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CalibrationProfile>(&content) {
            Ok(profile) => {
                info!(path = %self.path.display(), saved_at = %profile.saved_at,
                      "loaded calibration profile");
                Some(profile.model)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e,
                      "calibration profile unreadable, ignoring");
                None
            }
        }
    }

    pub fn save(&self, model: &CalibrationModel) -> Result<()> {
        let profile = CalibrationProfile {
            saved_at: Local::now().to_rfc3339(),
            quality: model.quality(),
            model: model.clone(),
        };
        let content = serde_json::to_string_pretty(&profile)?;
        fs::write(&self.path, content).context("failed to write calibration profile")?;
        info!(path = %self.path.display(), "saved calibration profile");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).context("failed to remove calibration profile")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen() -> ScreenConfig {
        ScreenConfig {
            width: 1920.0,
            height: 1080.0,
        }
    }

    fn exact_observations(targets: &[Point; TARGET_COUNT]) -> Vec<CalibrationObservation> {
        targets
            .iter()
            .enumerate()
            .map(|(i, t)| CalibrationObservation {
                target_index: i,
                samples: vec![*t],
                observed: *t,
                confidence: 1.0,
                degraded: false,
            })
            .collect()
    }

    #[test]
    fn grid_is_row_major_with_margins() {
        let targets = target_grid(&screen(), 0.08);
        assert_eq!(targets[0], Point::new(1920.0 * 0.08, 1080.0 * 0.08));
        assert_eq!(targets[4], Point::new(960.0, 540.0));
        assert_eq!(
            targets[8],
            Point::new(1920.0 - 1920.0 * 0.08, 1080.0 - 1080.0 * 0.08)
        );
        // Same row shares y.
        assert_eq!(targets[0].y, targets[2].y);
        // Same column shares x.
        assert_eq!(targets[1].x, targets[7].x);
    }

    #[test]
    fn exact_fit_has_zero_residual() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);
        let model =
            CalibrationModel::fit(exact_observations(&targets), &targets, &screen(), &cfg);

        for target in &targets {
            let mapped = model.affine_apply(*target);
            assert!(
                mapped.distance(*target) < 1.0,
                "target {target:?} mapped to {mapped:?}"
            );
        }
        let quality = model.quality();
        assert!(quality.mean_error_px < 1.0);
        assert_eq!(quality.rating, QualityRating::Excellent);
    }

    #[test]
    fn fit_corrects_uniform_shift() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);

        // Everything observed 60px right and 40px below its target.
        let observations: Vec<CalibrationObservation> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let observed = Point::new(t.x + 60.0, t.y + 40.0);
                CalibrationObservation {
                    target_index: i,
                    samples: vec![observed],
                    observed,
                    confidence: 1.0,
                    degraded: false,
                }
            })
            .collect();

        let model = CalibrationModel::fit(observations, &targets, &screen(), &cfg);

        // Mapping the raw observations must land closer to the targets than
        // the raw error (monotonic improvement on the fitting set).
        let raw_error = 72.11; // hypot(60, 40)
        let mut mapped_total = 0.0;
        for t in &targets {
            let observed = Point::new(t.x + 60.0, t.y + 40.0);
            mapped_total += model.affine_apply(observed).distance(*t);
        }
        let mapped_mean = mapped_total / targets.len() as f32;
        assert!(
            mapped_mean < raw_error,
            "mapped mean {mapped_mean} vs raw {raw_error}"
        );
    }

    #[test]
    fn fitted_scale_is_clamped() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);

        // Observations compressed into a tiny cloud around the screen center
        // would need a scale of ~50 to reach the targets; the clamp caps it.
        let center = Point::new(960.0, 540.0);
        let observations: Vec<CalibrationObservation> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let observed = Point::new(
                    center.x + (t.x - center.x) * 0.02,
                    center.y + (t.y - center.y) * 0.02,
                );
                CalibrationObservation {
                    target_index: i,
                    samples: vec![observed],
                    observed,
                    confidence: 1.0,
                    degraded: false,
                }
            })
            .collect();

        let model = CalibrationModel::fit(observations, &targets, &screen(), &cfg);
        assert_eq!(model.scale.x, cfg.scale_max);
        assert_eq!(model.scale.y, cfg.scale_max);
    }

    #[test]
    fn robust_average_resists_one_outlier() {
        let mut samples: Vec<Point> = (0..10)
            .map(|i| Point::new(500.0 + (i % 2) as f32, 400.0))
            .collect();
        samples.push(Point::new(1800.0, 1000.0));

        let robust = robust_average(&samples, 0.7);
        let naive = robust_average(&samples, 1.0);

        let cluster = Point::new(500.5, 400.0);
        assert!(
            robust.distance(cluster) < 2.0,
            "robust average at {robust:?}"
        );
        assert!(naive.distance(cluster) > 50.0, "naive average at {naive:?}");
    }

    #[test]
    fn robust_average_small_sets_use_plain_mean() {
        let samples = [
            Point::new(100.0, 100.0),
            Point::new(200.0, 100.0),
        ];
        let avg = robust_average(&samples, 0.7);
        assert_eq!(avg, Point::new(150.0, 100.0));
    }

    // ---- protocol ----

    fn stable_stabilizer(at: Point, start: Instant) -> TemporalStabilizer {
        let mut stab = TemporalStabilizer::new(&StabilizerConfig::default());
        for i in 0..25 {
            stab.push(at, start + Duration::from_millis(33 * i));
        }
        stab
    }

    #[test]
    fn full_protocol_produces_nine_observations() {
        let cal_cfg = CalibrationConfig::default();
        let stab_cfg = StabilizerConfig::default();
        let mut engine = CalibrationEngine::new(&cal_cfg, &stab_cfg, &screen());
        let t0 = Instant::now();

        engine.start(t0);
        assert_eq!(engine.phase(), CalibrationPhase::WaitingForStability(0));

        let mut now = t0 + Duration::from_secs(2);
        for i in 0..TARGET_COUNT {
            let target = engine.targets()[i];
            let stab = stable_stabilizer(target, now);
            // A few ticks ride out the stability dwell, then one sample per
            // tick fills the point. Stop as soon as the protocol moves on so
            // the next target starts from a fresh fixation.
            for _ in 0..40 {
                now += Duration::from_millis(200);
                engine.tick(now, &stab);
                if engine.current_target().map(|(idx, _)| idx) != Some(i) {
                    break;
                }
            }
        }

        assert!(engine.is_calibrated());
        assert_eq!(engine.phase(), CalibrationPhase::Calibrated);
        let model = engine.model().unwrap();
        assert_eq!(model.observations.len(), TARGET_COUNT);

        let events = engine.drain_events();
        let recorded = events
            .iter()
            .filter(|e| matches!(e, CalibrationEvent::PointRecorded { .. }))
            .count();
        assert_eq!(recorded, TARGET_COUNT);
        assert!(matches!(events.first(), Some(CalibrationEvent::Started)));
        assert!(matches!(
            events.last(),
            Some(CalibrationEvent::Completed(_))
        ));
    }

    #[test]
    fn cancel_preserves_installed_model() {
        let cal_cfg = CalibrationConfig::default();
        let stab_cfg = StabilizerConfig::default();
        let mut engine = CalibrationEngine::new(&cal_cfg, &stab_cfg, &screen());
        let targets = *engine.targets();
        engine.install(CalibrationModel::fit(
            exact_observations(&targets),
            &targets,
            &screen(),
            &cal_cfg,
        ));

        let t0 = Instant::now();
        engine.start(t0);
        engine.cancel();

        assert!(engine.is_calibrated(), "cancel must not drop the model");
        let events = engine.drain_events();
        assert!(events.contains(&CalibrationEvent::Cancelled));
    }

    #[test]
    fn stability_timeout_proceeds_anyway() {
        let cal_cfg = CalibrationConfig::default();
        let stab_cfg = StabilizerConfig::default();
        let mut engine = CalibrationEngine::new(&cal_cfg, &stab_cfg, &screen());
        let t0 = Instant::now();

        // A stabilizer that never becomes stable.
        let mut unstable = TemporalStabilizer::new(&stab_cfg);
        for i in 0..30 {
            let p = if i % 2 == 0 {
                Point::new(100.0, 100.0)
            } else {
                Point::new(900.0, 800.0)
            };
            unstable.push(p, t0 + Duration::from_millis(33 * i));
        }

        engine.start(t0);
        engine.tick(t0 + Duration::from_secs(1), &unstable);
        assert_eq!(engine.phase(), CalibrationPhase::WaitingForStability(0));

        let past_timeout =
            t0 + Duration::from_secs_f32(cal_cfg.stability_timeout_s) + Duration::from_secs(1);
        engine.tick(past_timeout, &unstable);
        assert_eq!(engine.phase(), CalibrationPhase::Collecting(0));
    }

    #[test]
    fn starved_point_records_degraded_observation() {
        let cal_cfg = CalibrationConfig::default();
        let stab_cfg = StabilizerConfig::default();
        let mut engine = CalibrationEngine::new(&cal_cfg, &stab_cfg, &screen());
        let t0 = Instant::now();

        // Stabilizer with a position but effectively no fresh samples during
        // collection, so only the timeout path can finish the point.
        let stab = stable_stabilizer(Point::new(400.0, 300.0), t0);

        engine.start(t0);
        engine.tick(t0 + Duration::from_secs(2), &stab); // -> Collecting

        // Jump straight past the point timeout: at most a couple of samples
        // were gathered, below min_samples.
        let late = t0 + Duration::from_secs_f32(cal_cfg.point_timeout_s) + Duration::from_secs(3);
        engine.tick(late, &stab);

        let events = engine.drain_events();
        let recorded = events.iter().find_map(|e| match e {
            CalibrationEvent::PointRecorded { index, .. } => Some(*index),
            _ => None,
        });
        assert_eq!(recorded, Some(0));
        assert!(engine.observations[0].degraded);
        assert!(engine.observations[0].confidence < 0.2);
    }

    #[test]
    fn record_point_nudges_the_protocol() {
        let cal_cfg = CalibrationConfig::default();
        let stab_cfg = StabilizerConfig::default();
        let mut engine = CalibrationEngine::new(&cal_cfg, &stab_cfg, &screen());
        let t0 = Instant::now();
        let stab = stable_stabilizer(Point::new(200.0, 200.0), t0);

        engine.start(t0);
        engine.record_point(t0 + Duration::from_millis(100), &stab);
        assert_eq!(engine.phase(), CalibrationPhase::Collecting(0));

        engine.record_point(t0 + Duration::from_millis(200), &stab);
        assert_eq!(engine.phase(), CalibrationPhase::WaitingForStability(1));
    }

    #[test]
    fn profile_round_trip_is_lossless() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);
        let model =
            CalibrationModel::fit(exact_observations(&targets), &targets, &screen(), &cfg);

        let dir = std::env::temp_dir().join("petgaze_profile_test");
        let store = ProfileStore::new(dir.to_str().unwrap()).unwrap();
        store.save(&model).unwrap();
        let loaded = store.load().unwrap();
        store.clear().unwrap();

        assert_eq!(loaded.offset, model.offset);
        assert_eq!(loaded.scale, model.scale);
        assert_eq!(loaded.observations.len(), model.observations.len());
        for (a, b) in loaded.observations.iter().zip(&model.observations) {
            assert_eq!(a.observed, b.observed);
            assert_eq!(a.confidence, b.confidence);
        }
        // Identical mapping behavior after reload.
        let probe = Point::new(777.0, 333.0);
        assert_eq!(loaded.affine_apply(probe), model.affine_apply(probe));
    }
}
