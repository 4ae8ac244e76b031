use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod args;

use args::Args;
use petgaze::calibration::CalibrationEvent;
use petgaze::camera::{CameraSource, FrameSource, SyntheticSource};
use petgaze::config::AppConfig;
use petgaze::detector::FixedRegionFinder;
use petgaze::engine::{GazeEngine, GazeEvent};
use petgaze::pipeline::DetectionPipeline;
use petgaze::types::Point;

const BG: u32 = 0x1a1a22;
const TARGET_DIM: u32 = 0x3c3c50;
const TARGET_ACTIVE: u32 = 0xffc832;
const GAZE_RAW: u32 = 0x50c8ff;
const GAZE_CALIBRATED: u32 = 0x50ff78;
const GAZE_INVALID: u32 = 0x783c3c;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    if args.list {
        let cameras = nokhwa::query(nokhwa::utils::ApiBackend::Auto)?;
        println!("Available Cameras:");
        println!("{:<5} | {:<30}", "Index", "Name");
        println!("{}", "-".repeat(40));
        for cam in cameras {
            println!("{:<5} | {:<30}", cam.index(), cam.human_name());
        }
        return Ok(());
    }

    let mut config = AppConfig::load_from(&args.config)?;
    if let Some(index) = args.cam_index {
        config.camera.index = index;
    }
    if args.single_thread {
        config.camera.threaded = false;
    }

    let mut engine = if args.synthetic {
        let source = SyntheticSource::new(640, 480);
        let finder = FixedRegionFinder::new(source.face_rect());
        let pipeline = DetectionPipeline::with_finder(&config, Box::new(finder));
        GazeEngine::with_pipeline(config.clone(), Box::new(source), pipeline)?
    } else {
        let source = CameraSource::new(&config.camera)?;
        info!(camera = %source.name(), "frame source ready");
        GazeEngine::new(config.clone(), Box::new(source))?
    };

    let state = engine.gaze_state();

    // Preview canvas at half the screen size; everything drawn here comes
    // from the published state and events, never from inside the pipeline.
    let scale = 0.5f32;
    let canvas_w = (config.screen.width * scale) as usize;
    let canvas_h = (config.screen.height * scale) as usize;
    let mut window = minifb::Window::new(
        "petgaze",
        canvas_w,
        canvas_h,
        minifb::WindowOptions::default(),
    )
    .map_err(|e| anyhow::anyhow!("failed to create window: {}", e))?;
    window.limit_update_rate(Some(std::time::Duration::from_micros(16_600)));

    let mut buffer = vec![BG; canvas_w * canvas_h];

    info!("controls: [C] calibrate  [P] record point  [X] cancel  [R] reset  [M] mirror  [D] detection mode  [S] restart camera  [Esc] quit");

    while window.is_open() && !window.is_key_down(minifb::Key::Escape) {
        for key in window.get_keys_pressed(minifb::KeyRepeat::No) {
            match key {
                minifb::Key::C => engine.start_calibration(),
                minifb::Key::P => engine.record_calibration_point(),
                minifb::Key::X => engine.cancel_calibration(),
                minifb::Key::R => engine.reset_calibration(),
                minifb::Key::M => engine.toggle_mirror(),
                minifb::Key::D => engine.toggle_detection_mode(),
                minifb::Key::S => {
                    if let Err(e) = engine.restart_source() {
                        warn!(error = %e, "camera restart failed");
                    }
                }
                _ => {}
            }
        }

        for event in engine.tick() {
            match event {
                GazeEvent::Fixation(fix) => {
                    info!(x = fix.point.x, y = fix.point.y, "fixation");
                }
                GazeEvent::Calibration(CalibrationEvent::PointRecorded {
                    index,
                    residual,
                    ..
                }) => {
                    info!(index, residual, "point recorded");
                }
                GazeEvent::Calibration(CalibrationEvent::Completed(report)) => {
                    info!(
                        mean_error_px = report.mean_error_px,
                        max_error_px = report.max_error_px,
                        rating = ?report.rating,
                        "calibration completed"
                    );
                }
                GazeEvent::Calibration(other) => {
                    info!(event = ?other, "calibration");
                }
            }
        }

        buffer.fill(BG);

        let active = engine.current_calibration_target();
        for (i, target) in engine.calibration_targets().iter().enumerate() {
            let color = match active {
                Some((idx, _)) if idx == i => TARGET_ACTIVE,
                _ => TARGET_DIM,
            };
            draw_crosshair(&mut buffer, canvas_w, canvas_h, *target, scale, color);
        }

        let snapshot = state.snapshot();
        let color = if !snapshot.is_valid {
            GAZE_INVALID
        } else if snapshot.is_calibrated {
            GAZE_CALIBRATED
        } else {
            GAZE_RAW
        };
        draw_disk(&mut buffer, canvas_w, canvas_h, snapshot.screen, scale, 6, color);

        window
            .update_with_buffer(&buffer, canvas_w, canvas_h)
            .map_err(|e| anyhow::anyhow!("window update failed: {}", e))?;
    }

    Ok(())
}

fn draw_crosshair(
    buffer: &mut [u32],
    width: usize,
    height: usize,
    point: Point,
    scale: f32,
    color: u32,
) {
    let cx = (point.x * scale) as i32;
    let cy = (point.y * scale) as i32;
    let size = 10;
    for i in -size..=size {
        put_pixel(buffer, width, height, cx + i, cy, color);
        put_pixel(buffer, width, height, cx, cy + i, color);
    }
}

fn draw_disk(
    buffer: &mut [u32],
    width: usize,
    height: usize,
    point: Point,
    scale: f32,
    radius: i32,
    color: u32,
) {
    let cx = (point.x * scale) as i32;
    let cy = (point.y * scale) as i32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel(buffer, width, height, cx + dx, cy + dy, color);
            }
        }
    }
}

fn put_pixel(buffer: &mut [u32], width: usize, height: usize, x: i32, y: i32, color: u32) {
    if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
        buffer[y as usize * width + x as usize] = color;
    }
}
