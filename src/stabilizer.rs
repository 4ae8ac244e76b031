use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{FixationConfig, StabilizerConfig};
use crate::types::Point;

/// Smooths and filters raw gaze points across frames and classifies the gaze
/// as settled or moving. Knows nothing about calibration; it only answers
/// "where is the gaze, roughly" and "is it holding still".
pub struct TemporalStabilizer {
    config: StabilizerConfig,
    history: VecDeque<Point>,
    current: Option<Point>,
    stable_since: Option<Instant>,
    last_push: Option<Instant>,
}

impl TemporalStabilizer {
    pub fn new(config: &StabilizerConfig) -> Self {
        Self {
            config: config.clone(),
            history: VecDeque::with_capacity(config.history_len + 1),
            current: None,
            stable_since: None,
            last_push: None,
        }
    }

    /// Feed one raw point in screen pixels. Returns the smoothed point.
    pub fn push(&mut self, raw: Point, now: Instant) -> Point {
        let dt = self
            .last_push
            .map(|t| now.saturating_duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_push = Some(now);

        let rate = (self.config.smoothing_factor * dt).clamp(0.0, 1.0);
        let current = match self.current {
            None => raw,
            Some(c) => c.lerp(raw, rate),
        };
        self.current = Some(current);

        self.history.push_back(raw);
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }

        self.update_stability(now);
        current
    }

    fn update_stability(&mut self, now: Instant) {
        let settled = self.deviation_below_threshold();
        match (settled, self.stable_since) {
            (true, None) => self.stable_since = Some(now),
            (false, Some(_)) => {
                debug!("gaze stability lost");
                self.stable_since = None;
            }
            _ => {}
        }
    }

    fn deviation_below_threshold(&self) -> bool {
        if self.history.len() < self.min_window() {
            return false;
        }
        let Some(mean) = self.window_mean() else {
            return false;
        };
        self.mean_abs_deviation(mean) < self.config.stability_threshold_px
    }

    fn min_window(&self) -> usize {
        self.config.history_len.min(5).max(2)
    }

    /// True once the deviation condition has held for the configured dwell.
    pub fn is_stable(&self, now: Instant) -> bool {
        self.stable_since.map_or(false, |since| {
            now.saturating_duration_since(since)
                >= Duration::from_secs_f32(self.config.stability_min_duration_s)
        })
    }

    pub fn smoothed(&self) -> Option<Point> {
        self.current
    }

    fn window_mean(&self) -> Option<Point> {
        if self.history.is_empty() {
            return None;
        }
        let mut sum = Point::default();
        for p in &self.history {
            sum.x += p.x;
            sum.y += p.y;
        }
        let n = self.history.len() as f32;
        Some(Point::new(sum.x / n, sum.y / n))
    }

    fn mean_abs_deviation(&self, mean: Point) -> f32 {
        if self.history.is_empty() {
            return f32::INFINITY;
        }
        let total: f32 = self.history.iter().map(|p| p.distance(mean)).sum();
        total / self.history.len() as f32
    }

    /// Mean of the history window after discarding samples farther than the
    /// outlier distance from the rough mean. This is the point calibration
    /// samples from.
    pub fn robust_mean(&self) -> Option<Point> {
        let rough = self.window_mean()?;
        let kept: Vec<&Point> = self
            .history
            .iter()
            .filter(|p| p.distance(rough) <= self.config.outlier_distance_px)
            .collect();
        if kept.is_empty() {
            return Some(rough);
        }
        let n = kept.len() as f32;
        let sum_x: f32 = kept.iter().map(|p| p.x).sum();
        let sum_y: f32 = kept.iter().map(|p| p.y).sum();
        Some(Point::new(sum_x / n, sum_y / n))
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.current = None;
        self.stable_since = None;
        self.last_push = None;
    }
}

/// Raised when the stabilized gaze has dwelled inside a small radius long
/// enough to count as a pointer click.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixationEvent {
    pub point: Point,
    pub dwell: Duration,
}

/// Dwell-based fixation detector over the mapped gaze point. Fires once per
/// dwell; re-arms when the gaze leaves the radius.
pub struct FixationDetector {
    config: FixationConfig,
    anchor: Option<Point>,
    since: Option<Instant>,
    fired: bool,
}

impl FixationDetector {
    pub fn new(config: &FixationConfig) -> Self {
        Self {
            config: config.clone(),
            anchor: None,
            since: None,
            fired: false,
        }
    }

    pub fn update(&mut self, point: Point, now: Instant) -> Option<FixationEvent> {
        match (self.anchor, self.since) {
            (Some(anchor), Some(since)) if point.distance(anchor) <= self.config.radius_px => {
                let dwell = now.saturating_duration_since(since);
                if !self.fired && dwell >= Duration::from_secs_f32(self.config.dwell_s) {
                    self.fired = true;
                    return Some(FixationEvent {
                        point: anchor,
                        dwell,
                    });
                }
            }
            _ => {
                self.anchor = Some(point);
                self.since = Some(now);
                self.fired = false;
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.anchor = None;
        self.since = None;
        self.fired = false;
    }
}
