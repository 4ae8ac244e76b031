use image::{imageops, imageops::FilterType, GrayImage};

use crate::config::{PupilConfig, PupilMode};
use crate::types::{Frame, Point, PupilPosition, Rect};

/// Locates a sub-pixel pupil center inside an eye region.
///
/// Two strategies: `Basic` blurs the region and takes the darkest pixel;
/// `Precise` runs a contour pass (upscale, denoise, threshold, morphology,
/// circularity scoring) and falls back to `Basic` when no contour survives
/// filtering.
pub struct PupilLocator {
    config: PupilConfig,
}

impl PupilLocator {
    pub fn new(config: &PupilConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Switch strategy at runtime; the host toggles this between frames.
    pub fn set_mode(&mut self, mode: PupilMode) {
        self.config.mode = mode;
    }

    pub fn locate(&self, frame: &Frame, eye: Rect) -> PupilPosition {
        // Degenerate regions yield the geometric center at zero confidence
        // rather than an error.
        let Some(clipped) = eye.clipped(frame.width(), frame.height()) else {
            return PupilPosition::new(eye.center(), 0.0);
        };
        if clipped.width < 4.0 || clipped.height < 4.0 {
            return PupilPosition::new(clipped.center(), 0.0);
        }

        let crop = imageops::crop_imm(
            &frame.gray,
            clipped.x as u32,
            clipped.y as u32,
            clipped.width as u32,
            clipped.height as u32,
        )
        .to_image();

        let (local, confidence) = match self.config.mode {
            PupilMode::Basic => self.locate_basic(&crop),
            PupilMode::Precise => self
                .locate_precise(&crop)
                .unwrap_or_else(|| self.locate_basic(&crop)),
        };

        let refined = self.refine_subpixel(&crop, local);
        PupilPosition::new(
            Point::new(clipped.x + refined.x, clipped.y + refined.y),
            confidence,
        )
    }

    /// Blur, then darkest pixel. Low confidence by construction.
    fn locate_basic(&self, crop: &GrayImage) -> (Point, f32) {
        let blurred = box_blur3(crop);
        let mut best = (0u32, 0u32);
        let mut best_val = u8::MAX;
        for (x, y, px) in blurred.enumerate_pixels() {
            if px[0] < best_val {
                best_val = px[0];
                best = (x, y);
            }
        }
        (Point::new(best.0 as f32 + 0.5, best.1 as f32 + 0.5), 0.25)
    }

    /// Contour pass. Returns `None` when no candidate passes filtering.
    fn locate_precise(&self, crop: &GrayImage) -> Option<(Point, f32)> {
        // Work at 2x so small pupils have enough pixels for a stable contour.
        let up_w = crop.width() * 2;
        let up_h = crop.height() * 2;
        let upscaled = imageops::resize(crop, up_w, up_h, FilterType::Triangle);
        let denoised = median3(&upscaled);

        // Otsu split, inverted: the pupil is the dark class.
        let level = otsu_level(&denoised);
        let mut mask = Mask::from_image(&denoised, level);

        // Close then open to heal the contour and drop speckle noise.
        mask = mask.dilate().erode();
        mask = mask.erode().dilate();

        let components = mask.components(&denoised);
        let eye_area = (up_w * up_h) as f32;
        let ideal_area = eye_area * 0.04;

        let mut best: Option<(&Component, f32)> = None;
        for comp in &components {
            if comp.area < 6 || comp.area as f32 > eye_area * 0.5 {
                continue;
            }
            let circularity = comp.circularity();
            if circularity < self.config.min_circularity {
                continue;
            }
            let darkness = 1.0 - comp.mean_luma / 255.0;
            let area = comp.area as f32;
            let plausibility = 1.0 - ((area - ideal_area).abs() / ideal_area).min(1.0);
            let score = 0.5 * circularity + 0.3 * darkness + 0.2 * plausibility;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((comp, score));
            }
        }

        best.map(|(comp, score)| {
            let (cx, cy) = comp.centroid();
            // Back to original crop coordinates.
            (Point::new(cx / 2.0, cy / 2.0), score.min(1.0))
        })
    }

    /// Darkness-weighted centroid over a small neighborhood around the
    /// candidate. The shift is clamped so noise cannot drag the estimate off
    /// the pupil.
    fn refine_subpixel(&self, crop: &GrayImage, initial: Point) -> Point {
        let r = self.config.refine_radius;
        let cx = initial.x as i32;
        let cy = initial.y as i32;

        let mut max_luma = 0u8;
        for dy in -r..=r {
            for dx in -r..=r {
                if let Some(v) = pixel_at(crop, cx + dx, cy + dy) {
                    max_luma = max_luma.max(v);
                }
            }
        }

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut total = 0.0;
        for dy in -r..=r {
            for dx in -r..=r {
                if let Some(v) = pixel_at(crop, cx + dx, cy + dy) {
                    let w = (max_luma - v) as f32;
                    sum_x += (cx + dx) as f32 * w;
                    sum_y += (cy + dy) as f32 * w;
                    total += w;
                }
            }
        }
        if total <= 0.0 {
            return initial;
        }

        let refined = Point::new(sum_x / total + 0.5, sum_y / total + 0.5);
        let shift = initial.distance(refined);
        if shift <= self.config.refine_max_shift {
            refined
        } else {
            initial.lerp(refined, self.config.refine_max_shift / shift)
        }
    }
}

fn pixel_at(img: &GrayImage, x: i32, y: i32) -> Option<u8> {
    if x < 0 || y < 0 || x as u32 >= img.width() || y as u32 >= img.height() {
        None
    } else {
        Some(img.get_pixel(x as u32, y as u32)[0])
    }
}

/// 3x3 box blur with edge clamping.
fn box_blur3(img: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    for y in 0..img.height() as i32 {
        for x in 0..img.width() as i32 {
            let mut sum = 0u32;
            let mut count = 0u32;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if let Some(v) = pixel_at(img, x + dx, y + dy) {
                        sum += v as u32;
                        count += 1;
                    }
                }
            }
            out.put_pixel(x as u32, y as u32, image::Luma([(sum / count) as u8]));
        }
    }
    out
}

/// 3x3 median filter. Edge-preserving, unlike a plain blur.
fn median3(img: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(img.width(), img.height());
    let mut window = [0u8; 9];
    for y in 0..img.height() as i32 {
        for x in 0..img.width() as i32 {
            let mut n = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    if let Some(v) = pixel_at(img, x + dx, y + dy) {
                        window[n] = v;
                        n += 1;
                    }
                }
            }
            window[..n].sort_unstable();
            out.put_pixel(x as u32, y as u32, image::Luma([window[n / 2]]));
        }
    }
    out
}

/// Otsu's threshold over the full image histogram.
fn otsu_level(img: &GrayImage) -> u8 {
    let mut hist = [0u32; 256];
    for px in img.pixels() {
        hist[px[0] as usize] += 1;
    }
    let total = (img.width() * img.height()) as f64;

    let mut sum_all = 0.0;
    for (v, &count) in hist.iter().enumerate() {
        sum_all += v as f64 * count as f64;
    }

    let mut sum_back = 0.0;
    let mut weight_back = 0.0;
    let mut best_level = 0u8;
    let mut best_variance = 0.0;

    for (v, &count) in hist.iter().enumerate() {
        weight_back += count as f64;
        if weight_back == 0.0 {
            continue;
        }
        let weight_fore = total - weight_back;
        if weight_fore == 0.0 {
            break;
        }
        sum_back += v as f64 * count as f64;
        let mean_back = sum_back / weight_back;
        let mean_fore = (sum_all - sum_back) / weight_fore;
        let variance = weight_back * weight_fore * (mean_back - mean_fore).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_level = v as u8;
        }
    }
    best_level
}

/// Binary mask over the thresholded eye crop.
struct Mask {
    bits: Vec<bool>,
    width: u32,
    height: u32,
}

impl Mask {
    fn from_image(img: &GrayImage, level: u8) -> Self {
        let bits = img.pixels().map(|p| p[0] <= level).collect();
        Self {
            bits,
            width: img.width(),
            height: img.height(),
        }
    }

    fn get(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            false
        } else {
            self.bits[(y as u32 * self.width + x as u32) as usize]
        }
    }

    fn morph(&self, set_if_any: bool) -> Mask {
        let mut bits = vec![false; self.bits.len()];
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let mut any = false;
                let mut all = true;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let v = self.get(x + dx, y + dy);
                        any |= v;
                        all &= v;
                    }
                }
                bits[(y as u32 * self.width + x as u32) as usize] =
                    if set_if_any { any } else { all };
            }
        }
        Mask {
            bits,
            width: self.width,
            height: self.height,
        }
    }

    fn dilate(&self) -> Mask {
        self.morph(true)
    }

    fn erode(&self) -> Mask {
        self.morph(false)
    }

    /// Connected components with the statistics the scorer needs. `source`
    /// provides the luma under each component.
    fn components(&self, source: &GrayImage) -> Vec<Component> {
        let mut visited = vec![false; self.bits.len()];
        let mut components = Vec::new();

        for start_y in 0..self.height {
            for start_x in 0..self.width {
                let idx = (start_y * self.width + start_x) as usize;
                if visited[idx] || !self.bits[idx] {
                    continue;
                }

                let mut comp = Component::default();
                let mut luma_sum = 0u64;
                let mut stack = vec![(start_x as i32, start_y as i32)];
                visited[idx] = true;

                while let Some((x, y)) = stack.pop() {
                    comp.area += 1;
                    comp.sum_x += x as f64;
                    comp.sum_y += y as f64;
                    luma_sum += source.get_pixel(x as u32, y as u32)[0] as u64;

                    let neighbors = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)];
                    let mut boundary = false;
                    for (nx, ny) in neighbors {
                        if self.get(nx, ny) {
                            if nx >= 0
                                && ny >= 0
                                && (nx as u32) < self.width
                                && (ny as u32) < self.height
                            {
                                let nidx = (ny as u32 * self.width + nx as u32) as usize;
                                if !visited[nidx] {
                                    visited[nidx] = true;
                                    stack.push((nx, ny));
                                }
                            }
                        } else {
                            boundary = true;
                        }
                    }
                    if boundary {
                        comp.perimeter += 1;
                    }
                }

                comp.mean_luma = luma_sum as f32 / comp.area as f32;
                components.push(comp);
            }
        }

        components
    }
}

#[derive(Default)]
struct Component {
    area: usize,
    perimeter: usize,
    sum_x: f64,
    sum_y: f64,
    mean_luma: f32,
}

impl Component {
    /// 4*pi*A/P^2, clamped to [0, 1]. Discrete perimeters overshoot for tiny
    /// blobs, hence the clamp.
    fn circularity(&self) -> f32 {
        if self.perimeter == 0 {
            return 0.0;
        }
        let a = self.area as f32;
        let p = self.perimeter as f32;
        (4.0 * std::f32::consts::PI * a / (p * p)).min(1.0)
    }

    fn centroid(&self) -> (f32, f32) {
        (
            (self.sum_x / self.area as f64) as f32 + 0.5,
            (self.sum_y / self.area as f64) as f32 + 0.5,
        )
    }
}
