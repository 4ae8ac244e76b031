use crate::calibration::CalibrationModel;
use crate::config::{CalibrationConfig, ScreenConfig};
use crate::types::Point;

/// Applies the calibration model to a stabilized raw point to produce the
/// final on-screen gaze coordinate.
///
/// Two layers: the model's global affine correction, blended with an
/// inverse-distance-weighted correction derived from the 9 observation
/// anchors. Points near a calibration target get person- and region-specific
/// correction; points far from every target degrade gracefully to the affine
/// estimate. Output is always clamped to the screen.
pub struct CoordinateMapper {
    screen_width: f32,
    screen_height: f32,
    local_blend: f32,
    idw_epsilon: f32,
}

impl CoordinateMapper {
    pub fn new(screen: &ScreenConfig, config: &CalibrationConfig) -> Self {
        Self {
            screen_width: screen.width,
            screen_height: screen.height,
            local_blend: config.local_blend.clamp(0.0, 1.0),
            idw_epsilon: config.idw_epsilon.max(1e-6),
        }
    }

    pub fn map(&self, raw: Point, model: Option<&CalibrationModel>) -> Point {
        let Some(model) = model else {
            // Uncalibrated pass-through.
            return self.clamp(raw);
        };

        let affine = model.affine_apply(raw);

        // Inverse-distance blend of each anchor's locally observed
        // correction vector. Distances are measured in raw space, since the
        // anchors are raw observations.
        let mut weight_sum = 0.0;
        let mut correction = Point::default();
        for obs in &model.observations {
            let target = model.targets[obs.target_index];
            let anchor_error = {
                let mapped_anchor = model.affine_apply(obs.observed);
                Point::new(target.x - mapped_anchor.x, target.y - mapped_anchor.y)
            };
            let dx = raw.x - obs.observed.x;
            let dy = raw.y - obs.observed.y;
            let w = 1.0 / (dx * dx + dy * dy + self.idw_epsilon);
            correction.x += w * anchor_error.x;
            correction.y += w * anchor_error.y;
            weight_sum += w;
        }

        let mapped = if weight_sum > 0.0 {
            Point::new(
                affine.x + self.local_blend * correction.x / weight_sum,
                affine.y + self.local_blend * correction.y / weight_sum,
            )
        } else {
            affine
        };

        self.clamp(mapped)
    }

    fn clamp(&self, p: Point) -> Point {
        Point::new(
            p.x.clamp(0.0, self.screen_width),
            p.y.clamp(0.0, self.screen_height),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{target_grid, CalibrationModel, CalibrationObservation, TARGET_COUNT};

    fn screen() -> ScreenConfig {
        ScreenConfig {
            width: 1920.0,
            height: 1080.0,
        }
    }

    fn mapper() -> CoordinateMapper {
        CoordinateMapper::new(&screen(), &CalibrationConfig::default())
    }

    fn observation(index: usize, observed: Point) -> CalibrationObservation {
        CalibrationObservation {
            target_index: index,
            samples: vec![observed],
            observed,
            confidence: 1.0,
            degraded: false,
        }
    }

    fn exact_model() -> CalibrationModel {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);
        let observations = targets
            .iter()
            .enumerate()
            .map(|(i, t)| observation(i, *t))
            .collect();
        CalibrationModel::fit(observations, &targets, &screen(), &cfg)
    }

    #[test]
    fn uncalibrated_is_pass_through() {
        let m = mapper();
        let p = Point::new(123.0, 456.0);
        assert_eq!(m.map(p, None), p);
    }

    #[test]
    fn pass_through_still_clamps() {
        let m = mapper();
        let p = m.map(Point::new(-50.0, 5000.0), None);
        assert_eq!(p, Point::new(0.0, 1080.0));
    }

    #[test]
    fn exact_fit_round_trips_every_target() {
        let m = mapper();
        let model = exact_model();
        for obs in &model.observations {
            let mapped = m.map(obs.observed, Some(&model));
            let target = model.targets[obs.target_index];
            assert!(
                mapped.distance(target) < 2.0,
                "observation {} mapped {:?} expected {:?}",
                obs.target_index,
                mapped,
                target
            );
        }
    }

    #[test]
    fn output_never_leaves_screen() {
        let m = mapper();
        let model = exact_model();
        let probes = [
            Point::new(-500.0, -500.0),
            Point::new(5000.0, 5000.0),
            Point::new(0.0, 5000.0),
            Point::new(1920.0, 1080.0),
        ];
        for p in probes {
            let mapped = m.map(p, Some(&model));
            assert!(mapped.x >= 0.0 && mapped.x <= 1920.0);
            assert!(mapped.y >= 0.0 && mapped.y <= 1080.0);
        }
    }

    #[test]
    fn local_correction_dominates_near_an_anchor() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);

        // Eight exact observations plus one locally shifted anchor: the
        // affine layer stays near-identity, so the shift shows up as a local
        // correction around that anchor.
        let shifted = Point::new(targets[4].x + 80.0, targets[4].y + 50.0);
        let observations: Vec<CalibrationObservation> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                if i == 4 {
                    observation(i, shifted)
                } else {
                    observation(i, *t)
                }
            })
            .collect();
        let model = CalibrationModel::fit(observations, &targets, &screen(), &cfg);

        let m = mapper();
        let affine_only = model.affine_apply(shifted);
        let mapped = m.map(shifted, Some(&model));

        let affine_error = affine_only.distance(targets[4]);
        let mapped_error = mapped.distance(targets[4]);
        assert!(
            mapped_error < affine_error * 0.6,
            "local blend should pull toward the target: affine {affine_error}, mapped {mapped_error}"
        );
    }

    #[test]
    fn far_queries_degrade_to_affine() {
        let cfg = CalibrationConfig::default();
        let targets = target_grid(&screen(), cfg.margin_fraction);
        let shifted = Point::new(targets[0].x + 120.0, targets[0].y);
        let observations: Vec<CalibrationObservation> = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                if i == 0 {
                    observation(i, shifted)
                } else {
                    observation(i, *t)
                }
            })
            .collect();
        let model = CalibrationModel::fit(observations, &targets, &screen(), &cfg);

        let m = mapper();
        // Querying the far corner: anchor 0's correction is diluted across
        // all nine weights, so the result hugs the affine estimate.
        let probe = targets[8];
        let affine_only = model.affine_apply(probe);
        let mapped = m.map(probe, Some(&model));
        assert!(
            mapped.distance(affine_only) < 15.0,
            "far query drifted {} px from affine",
            mapped.distance(affine_only)
        );
    }

    #[test]
    fn model_count_invariant_holds() {
        let model = exact_model();
        assert_eq!(model.observations.len(), TARGET_COUNT);
    }
}
