use anyhow::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::calibration::{
    CalibrationEngine, CalibrationEvent, CalibrationPhase, ProfileStore, TARGET_COUNT,
};
use crate::camera::FrameSource;
use crate::config::{AppConfig, PupilMode};
use crate::error::GazeError;
use crate::gaze;
use crate::mapper::CoordinateMapper;
use crate::pipeline::{DetectionPipeline, PipelineSettings};
use crate::stabilizer::{FixationDetector, FixationEvent, TemporalStabilizer};
use crate::types::{Frame, GazeSample, GazeSnapshot, Point};

/// Events surfaced to the host by each tick.
#[derive(Debug, Clone)]
pub enum GazeEvent {
    Fixation(FixationEvent),
    Calibration(CalibrationEvent),
}

/// Read handle onto the published gaze state. Single writer (the engine),
/// any number of readers.
#[derive(Clone)]
pub struct GazeState {
    inner: Arc<Mutex<GazeSnapshot>>,
}

impl GazeState {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GazeSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> GazeSnapshot {
        *self.inner.lock().unwrap()
    }

    fn publish(&self, snapshot: GazeSnapshot) {
        *self.inner.lock().unwrap() = snapshot;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    pub produced: u64,
    pub consumed: u64,
    pub dropped: u64,
}

struct Slot {
    frame: Option<(Frame, PipelineSettings)>,
    fresh: bool,
    result: Option<GazeSample>,
    produced: u64,
    consumed: u64,
    dropped: u64,
    worker_failed: bool,
}

/// Double-buffered frame hand-off between the main loop and the detection
/// worker. The lock is held only to move data in or out; detection never
/// runs under it. A frame arriving while the previous one is still unread
/// replaces it (latest-frame-wins) and counts as dropped.
#[derive(Clone)]
pub struct FrameHandoff {
    slot: Arc<Mutex<Slot>>,
}

impl FrameHandoff {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                frame: None,
                fresh: false,
                result: None,
                produced: 0,
                consumed: 0,
                dropped: 0,
                worker_failed: false,
            })),
        }
    }

    /// Producer side: install the newest frame, displacing any unread one.
    pub fn offer(&self, frame: Frame, settings: PipelineSettings) {
        let mut slot = self.slot.lock().unwrap();
        if slot.fresh {
            slot.dropped += 1;
        }
        slot.frame = Some((frame, settings));
        slot.fresh = true;
        slot.produced += 1;
    }

    /// Consumer side: claim the pending frame, if any.
    pub fn take(&self) -> Option<(Frame, PipelineSettings)> {
        let mut slot = self.slot.lock().unwrap();
        if !slot.fresh {
            return None;
        }
        slot.fresh = false;
        slot.consumed += 1;
        slot.frame.take()
    }

    /// Consumer side: publish the detection result for the claimed frame.
    pub fn publish(&self, sample: GazeSample) {
        self.slot.lock().unwrap().result = Some(sample);
    }

    /// Producer side: collect the most recent published result.
    pub fn poll_result(&self) -> Option<GazeSample> {
        self.slot.lock().unwrap().result.take()
    }

    pub fn mark_worker_failed(&self) {
        self.slot.lock().unwrap().worker_failed = true;
    }

    pub fn worker_failed(&self) -> bool {
        self.slot.lock().unwrap().worker_failed
    }

    pub fn stats(&self) -> HandoffStats {
        let slot = self.slot.lock().unwrap();
        HandoffStats {
            produced: slot.produced,
            consumed: slot.consumed,
            dropped: slot.dropped,
        }
    }
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

type PipelineFactory = Box<dyn FnOnce() -> Result<DetectionPipeline, GazeError> + Send>;

/// The core engine: owns the frame source, drives the detection pipeline
/// (inline or on a background worker), feeds the stabilizer and calibration
/// protocol, and publishes `GazeState` once per tick.
pub struct GazeEngine {
    config: AppConfig,
    source: Box<dyn FrameSource>,
    source_failed: bool,
    settings: PipelineSettings,

    // Inline pipeline; in threaded mode it doubles as the permanent
    // fallback when the worker dies.
    pipeline: Option<DetectionPipeline>,
    threaded: bool,
    handoff: FrameHandoff,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    pending_sample: Option<GazeSample>,

    stabilizer: TemporalStabilizer,
    fixation: FixationDetector,
    calibration: CalibrationEngine,
    mapper: CoordinateMapper,
    profile_store: ProfileStore,
    state: GazeState,
}

impl GazeEngine {
    /// Build the engine with the cascade-backed pipeline. Fails when the
    /// face model is missing, which disables the whole subsystem.
    pub fn new(config: AppConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        let pipeline = DetectionPipeline::new(&config)?;
        let factory_config = config.clone();
        let factory: PipelineFactory = Box::new(move || DetectionPipeline::new(&factory_config));
        let threaded = config.camera.threaded;
        Self::build(config, source, pipeline, threaded.then_some(factory))
    }

    /// Build the engine around a ready-made pipeline (synthetic sources,
    /// tests). Always runs inline: custom pipelines do not cross threads.
    pub fn with_pipeline(
        config: AppConfig,
        source: Box<dyn FrameSource>,
        pipeline: DetectionPipeline,
    ) -> Result<Self> {
        if config.camera.threaded {
            info!("custom pipeline provided, running single-threaded");
        }
        Self::build(config, source, pipeline, None)
    }

    fn build(
        config: AppConfig,
        source: Box<dyn FrameSource>,
        pipeline: DetectionPipeline,
        factory: Option<PipelineFactory>,
    ) -> Result<Self> {
        let profile_store = ProfileStore::new(&config.calibration.profile_dir)?;
        let mut calibration =
            CalibrationEngine::new(&config.calibration, &config.stabilizer, &config.screen);
        if let Some(model) = profile_store.load() {
            calibration.install(model);
        }

        let settings = PipelineSettings {
            mirror: config.camera.mirror,
            pupil_mode: config.pupil.mode,
        };

        let handoff = FrameHandoff::new();
        let stop = Arc::new(AtomicBool::new(false));
        let threaded = factory.is_some();
        let worker = factory.map(|factory| {
            let handoff = handoff.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || worker_loop(handoff, stop, factory))
        });

        Ok(Self {
            stabilizer: TemporalStabilizer::new(&config.stabilizer),
            fixation: FixationDetector::new(&config.fixation),
            mapper: CoordinateMapper::new(&config.screen, &config.calibration),
            calibration,
            profile_store,
            state: GazeState::new(),
            source,
            source_failed: false,
            settings,
            pipeline: Some(pipeline),
            threaded,
            handoff,
            stop,
            worker,
            pending_sample: None,
            config,
        })
    }

    /// Shareable read handle for consumers (renderer, pet logic, debug UI).
    pub fn gaze_state(&self) -> GazeState {
        self.state.clone()
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.calibration.phase()
    }

    pub fn calibration_targets(&self) -> &[Point; TARGET_COUNT] {
        self.calibration.targets()
    }

    pub fn current_calibration_target(&self) -> Option<(usize, Point)> {
        self.calibration.current_target()
    }

    pub fn handoff_stats(&self) -> HandoffStats {
        self.handoff.stats()
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    pub fn mirror(&self) -> bool {
        self.settings.mirror
    }

    pub fn pupil_mode(&self) -> PupilMode {
        self.settings.pupil_mode
    }

    // ---- control signals ----

    pub fn start_calibration(&mut self) {
        self.calibration.start(Instant::now());
    }

    pub fn cancel_calibration(&mut self) {
        self.calibration.cancel();
    }

    pub fn record_calibration_point(&mut self) {
        self.calibration.record_point(Instant::now(), &self.stabilizer);
    }

    pub fn reset_calibration(&mut self) {
        self.calibration.reset();
        if let Err(e) = self.profile_store.clear() {
            warn!(error = %e, "failed to remove calibration profile");
        }
    }

    pub fn toggle_mirror(&mut self) {
        self.settings.mirror = !self.settings.mirror;
        info!(mirror = self.settings.mirror, "mirror toggled");
    }

    pub fn toggle_detection_mode(&mut self) {
        self.settings.pupil_mode = match self.settings.pupil_mode {
            PupilMode::Basic => PupilMode::Precise,
            PupilMode::Precise => PupilMode::Basic,
        };
        info!(mode = ?self.settings.pupil_mode, "pupil detection mode toggled");
    }

    /// Explicit retry after a camera failure.
    pub fn restart_source(&mut self) -> Result<()> {
        self.source.restart()?;
        self.source_failed = false;
        info!("frame source restarted");
        Ok(())
    }

    // ---- main loop ----

    /// Run one engine cycle: capture, dispatch, integrate, publish. Returns
    /// the events raised during the cycle.
    pub fn tick(&mut self) -> Vec<GazeEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        if !self.source_failed {
            match self.source.capture() {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    // The camera stays down until the host explicitly asks
                    // for a restart; meanwhile the state is simply invalid.
                    error!(error = %e, "frame capture failed, source disabled");
                    self.source_failed = true;
                }
            }
        }

        if let Some(sample) = self.collect_sample() {
            self.integrate(sample, now, &mut events);
        }

        if self.source_failed {
            self.state.publish(GazeSnapshot {
                is_calibrated: self.calibration.is_calibrated(),
                ..GazeSnapshot::default()
            });
        }

        self.calibration.tick(now, &self.stabilizer);
        for event in self.calibration.drain_events() {
            if let CalibrationEvent::Completed(_) = &event {
                if let Some(model) = self.calibration.model() {
                    if let Err(e) = self.profile_store.save(model) {
                        warn!(error = %e, "failed to persist calibration profile");
                    }
                }
            }
            events.push(GazeEvent::Calibration(event));
        }

        events
    }

    fn dispatch(&mut self, frame: Frame) {
        if self.threaded {
            if self.handoff.worker_failed() {
                self.fall_back_to_inline();
            } else {
                self.handoff.offer(frame, self.settings);
                return;
            }
        }

        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        let settings = self.settings;
        // Per-frame detection errors stop at this boundary: a panic is
        // logged and treated as "no detection this frame".
        match catch_unwind(AssertUnwindSafe(|| pipeline.process(&frame, settings))) {
            Ok(sample) => self.pending_sample = Some(sample),
            Err(_) => {
                error!("detection panicked, treating as no detection this frame");
                self.pending_sample = Some(GazeSample::invalid(frame.timestamp));
            }
        }
    }

    fn collect_sample(&mut self) -> Option<GazeSample> {
        if self.threaded {
            self.handoff.poll_result()
        } else {
            self.pending_sample.take()
        }
    }

    fn integrate(&mut self, sample: GazeSample, now: Instant, events: &mut Vec<GazeEvent>) {
        let mut smoothed = self.stabilizer.smoothed();
        if sample.valid {
            let raw_screen = gaze::to_screen(
                sample.raw,
                self.config.screen.width,
                self.config.screen.height,
            );
            smoothed = Some(self.stabilizer.push(raw_screen, now));
        }

        let mapped = smoothed.map(|p| self.mapper.map(p, self.calibration.model()));

        if sample.valid {
            if let Some(mapped) = mapped {
                if let Some(fix) = self.fixation.update(mapped, now) {
                    events.push(GazeEvent::Fixation(fix));
                }
            }
        }

        self.state.publish(GazeSnapshot {
            raw: sample.raw,
            smoothed: smoothed.unwrap_or_default(),
            screen: mapped.unwrap_or_default(),
            is_valid: sample.valid,
            is_calibrated: self.calibration.is_calibrated(),
        });
    }

    /// Permanent single-thread fallback for the rest of the session; the
    /// worker is not respawned.
    fn fall_back_to_inline(&mut self) {
        warn!("detection worker failed, falling back to single-threaded processing");
        self.threaded = false;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GazeEngine {
    fn drop(&mut self) {
        // Deterministic teardown on every exit path: stop the worker, then
        // the source handle drops with the engine.
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(handoff: FrameHandoff, stop: Arc<AtomicBool>, factory: PipelineFactory) {
    let mut pipeline = match factory() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "worker pipeline construction failed");
            handoff.mark_worker_failed();
            return;
        }
    };
    info!("detection worker started");

    while !stop.load(Ordering::Relaxed) {
        let Some((frame, settings)) = handoff.take() else {
            std::thread::sleep(Duration::from_millis(2));
            continue;
        };

        match catch_unwind(AssertUnwindSafe(|| pipeline.process(&frame, settings))) {
            Ok(sample) => handoff.publish(sample),
            Err(_) => {
                error!("detection worker panicked");
                handoff.mark_worker_failed();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticSource;
    use crate::detector::FixedRegionFinder;
    use image::GrayImage;

    fn test_settings() -> PipelineSettings {
        PipelineSettings {
            mirror: false,
            pupil_mode: PupilMode::Precise,
        }
    }

    fn blank_frame() -> Frame {
        Frame::new(GrayImage::new(32, 32), Instant::now())
    }

    #[test]
    fn handoff_drops_unread_frames() {
        let handoff = FrameHandoff::new();
        handoff.offer(blank_frame(), test_settings());
        handoff.offer(blank_frame(), test_settings());
        handoff.offer(blank_frame(), test_settings());

        assert!(handoff.take().is_some());
        assert!(handoff.take().is_none(), "one offer, one take");

        let stats = handoff.stats();
        assert_eq!(stats.produced, 3);
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.dropped, stats.produced - stats.consumed);
    }

    #[test]
    fn handoff_slow_consumer_never_sees_a_frame_twice() {
        let handoff = FrameHandoff::new();
        let consumer = handoff.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let consumer_stop = Arc::clone(&stop);

        let worker = std::thread::spawn(move || {
            let mut seen = 0u64;
            while !consumer_stop.load(Ordering::Relaxed) {
                if consumer.take().is_some() {
                    seen += 1;
                    // Slow worker: ~5x the production interval.
                    std::thread::sleep(Duration::from_millis(10));
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            seen
        });

        for _ in 0..50 {
            handoff.offer(blank_frame(), test_settings());
            std::thread::sleep(Duration::from_millis(2));
        }
        // Wait until the consumer has drained the final frame so the books
        // balance exactly.
        for _ in 0..200 {
            let s = handoff.stats();
            if s.produced == s.consumed + s.dropped {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Relaxed);
        let seen = worker.join().unwrap();

        let stats = handoff.stats();
        assert_eq!(stats.produced, 50);
        assert_eq!(stats.consumed, seen);
        assert_eq!(
            stats.dropped,
            stats.produced - stats.consumed,
            "drop accounting must balance"
        );
        assert!(stats.dropped > 0, "a slow consumer must shed frames");
    }

    fn synthetic_engine(dir: &str) -> GazeEngine {
        let mut config = AppConfig::default();
        config.camera.threaded = false;
        config.camera.mirror = false;
        config.calibration.profile_dir = std::env::temp_dir()
            .join(dir)
            .to_string_lossy()
            .into_owned();

        let source = SyntheticSource::new(320, 240);
        let face = source.face_rect();
        let pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));
        GazeEngine::with_pipeline(config, Box::new(source), pipeline).unwrap()
    }

    #[test]
    fn inline_engine_publishes_valid_state() {
        let mut engine = synthetic_engine("petgaze_engine_valid");
        let state = engine.gaze_state();

        for _ in 0..5 {
            engine.tick();
        }

        let snapshot = state.snapshot();
        assert!(snapshot.is_valid, "synthetic pupils should be detected");
        assert!(snapshot.raw.x > 0.0 && snapshot.raw.x < 1.0);
        assert!(!snapshot.is_calibrated);

        let stats = engine.handoff_stats();
        // Inline mode never touches the hand-off slot.
        assert_eq!(stats.produced, 0);
    }

    #[test]
    fn failing_source_reports_invalid_until_restart() {
        struct FlakySource {
            fail: bool,
        }
        impl FrameSource for FlakySource {
            fn capture(&mut self) -> Result<Frame> {
                if self.fail {
                    anyhow::bail!("no device")
                } else {
                    Ok(blank_frame())
                }
            }
            fn width(&self) -> u32 {
                32
            }
            fn height(&self) -> u32 {
                32
            }
            fn name(&self) -> String {
                "flaky".into()
            }
            fn restart(&mut self) -> Result<()> {
                self.fail = false;
                Ok(())
            }
        }

        let mut config = AppConfig::default();
        config.camera.threaded = false;
        config.calibration.profile_dir = std::env::temp_dir()
            .join("petgaze_engine_flaky")
            .to_string_lossy()
            .into_owned();
        let pipeline = DetectionPipeline::with_finder(
            &config,
            Box::new(FixedRegionFinder::new(crate::types::Rect::new(
                0.0, 0.0, 32.0, 32.0,
            ))),
        );
        let mut engine = GazeEngine::with_pipeline(
            config,
            Box::new(FlakySource { fail: true }),
            pipeline,
        )
        .unwrap();
        let state = engine.gaze_state();

        engine.tick();
        engine.tick();
        assert!(!state.snapshot().is_valid);

        engine.restart_source().unwrap();
        engine.tick();
        // Source works again; the state machine is processing frames once
        // more (validity depends on detection, not on the source).
        let stats = engine.handoff_stats();
        assert_eq!(stats.produced, 0); // still inline
    }

    #[test]
    fn worker_construction_failure_falls_back_inline() {
        let mut config = AppConfig::default();
        config.camera.threaded = true;
        config.camera.mirror = false;
        config.calibration.profile_dir = std::env::temp_dir()
            .join("petgaze_engine_fallback")
            .to_string_lossy()
            .into_owned();

        let source = SyntheticSource::new(320, 240);
        let face = source.face_rect();
        let pipeline =
            DetectionPipeline::with_finder(&config, Box::new(FixedRegionFinder::new(face)));

        let factory: PipelineFactory = Box::new(|| {
            Err(GazeError::FaceModelMissing(std::path::PathBuf::from(
                "nowhere.bin",
            )))
        });
        let mut engine =
            GazeEngine::build(config, Box::new(source), pipeline, Some(factory)).unwrap();
        assert!(engine.is_threaded());

        // Give the worker time to fail, then tick until the fallback kicks
        // in and inline processing produces a valid snapshot.
        std::thread::sleep(Duration::from_millis(50));
        let state = engine.gaze_state();
        for _ in 0..5 {
            engine.tick();
        }

        assert!(!engine.is_threaded(), "engine must drop to inline mode");
        assert!(state.snapshot().is_valid);
    }

    #[test]
    fn calibration_events_flow_through_tick() {
        let mut engine = synthetic_engine("petgaze_engine_calib");
        engine.start_calibration();
        let events = engine.tick();
        assert!(events
            .iter()
            .any(|e| matches!(e, GazeEvent::Calibration(CalibrationEvent::Started))));
        assert!(matches!(
            engine.calibration_phase(),
            CalibrationPhase::WaitingForStability(0)
        ));

        engine.cancel_calibration();
        let events = engine.tick();
        assert!(events
            .iter()
            .any(|e| matches!(e, GazeEvent::Calibration(CalibrationEvent::Cancelled))));
    }

    #[test]
    fn toggles_flip_settings() {
        let mut engine = synthetic_engine("petgaze_engine_toggles");
        let mirror = engine.mirror();
        engine.toggle_mirror();
        assert_ne!(engine.mirror(), mirror);

        let mode = engine.pupil_mode();
        engine.toggle_detection_mode();
        assert_ne!(engine.pupil_mode(), mode);
    }
}
