use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
            Resolution},
    Camera,
};
use std::time::Instant;
use tracing::info;

use crate::config::CameraConfig;
use crate::types::Frame;

/// Something that produces frames for the detection pipeline. The camera is
/// the real implementation; the synthetic source stands in for demos and
/// tests, and a pointer-device-backed source would slot in the same way.
pub trait FrameSource {
    fn capture(&mut self) -> Result<Frame>;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn name(&self) -> String;

    /// Re-acquire the underlying device after a failure. Default is a no-op
    /// for sources that cannot fail.
    fn restart(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Webcam-backed frame source. Owns the camera handle exclusively for its
/// entire lifetime; the stream is released when the source is dropped.
pub struct CameraSource {
    camera: Camera,
    config: CameraConfig,
}

impl CameraSource {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let camera = Self::open(config)?;
        Ok(Self {
            camera,
            config: config.clone(),
        })
    }

    fn open(config: &CameraConfig) -> Result<Camera> {
        let index = CameraIndex::Index(config.index);
        let requested = if config.width > 0 && config.height > 0 {
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
                Resolution::new(config.width, config.height),
                FrameFormat::MJPEG,
                config.fps,
            )))
        } else {
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate)
        };

        let mut camera =
            Camera::new(index, requested).context("failed to create camera instance")?;
        camera
            .open_stream()
            .map_err(|e| anyhow!(e))
            .context("failed to open camera stream")?;

        info!(
            name = %camera.info().human_name(),
            format = %camera.camera_format(),
            "opened camera"
        );
        Ok(camera)
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<Frame> {
        let raw = self
            .camera
            .frame()
            .map_err(|e| anyhow!(e))
            .context("failed to capture frame")?;
        let rgb = raw
            .decode_image::<RgbFormat>()
            .map_err(|e| anyhow!(e))
            .context("failed to decode frame")?;
        let gray = image::imageops::grayscale(&rgb);
        Ok(Frame::new(gray, Instant::now()))
    }

    fn width(&self) -> u32 {
        self.camera.resolution().width()
    }

    fn height(&self) -> u32 {
        self.camera.resolution().height()
    }

    fn name(&self) -> String {
        self.camera.info().human_name()
    }

    fn restart(&mut self) -> Result<()> {
        info!(index = self.config.index, "restarting camera");
        self.camera = Self::open(&self.config)?;
        Ok(())
    }
}

/// Synthetic frame source: renders a face-like patch with two dark pupils
/// that drift in a slow circle. Lets the whole pipeline run without hardware
/// or model files.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }

    /// The face rect this source draws, for pairing with a fixed-region
    /// finder.
    pub fn face_rect(&self) -> crate::types::Rect {
        let fw = self.width as f32 * 0.4;
        let fh = self.height as f32 * 0.6;
        crate::types::Rect::new(
            (self.width as f32 - fw) / 2.0,
            (self.height as f32 - fh) / 2.0,
            fw,
            fh,
        )
    }

    fn draw_disk(img: &mut GrayImage, cx: f32, cy: f32, radius: f32, value: u8) {
        let r = radius.ceil() as i32;
        for dy in -r..=r {
            for dx in -r..=r {
                if (dx * dx + dy * dy) as f32 <= radius * radius {
                    let x = cx as i32 + dx;
                    let y = cy as i32 + dy;
                    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
                        img.put_pixel(x as u32, y as u32, image::Luma([value]));
                    }
                }
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Result<Frame> {
        self.tick += 1;
        let t = self.tick as f32 * 0.03;

        let mut gray = GrayImage::from_pixel(self.width, self.height, image::Luma([205u8]));
        let face = self.face_rect();

        // Face patch, slightly darker than the background.
        for y in face.y as u32..(face.y + face.height) as u32 {
            for x in face.x as u32..(face.x + face.width) as u32 {
                gray.put_pixel(x, y, image::Luma([165u8]));
            }
        }

        // Pupils drift together, as if tracking a slow circular target.
        let drift_x = t.cos() * face.width * 0.05;
        let drift_y = t.sin() * face.height * 0.04;
        let eye_y = face.y + face.height * 0.32 + drift_y;
        let eye_dx = face.width * 0.22;
        let radius = (face.width * 0.035).max(3.0);

        let center = face.center();
        Self::draw_disk(&mut gray, center.x - eye_dx + drift_x, eye_y, radius, 15);
        Self::draw_disk(&mut gray, center.x + eye_dx + drift_x, eye_y, radius, 15);

        Ok(Frame::new(gray, Instant::now()))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn name(&self) -> String {
        "synthetic".to_string()
    }
}
