use crate::types::{Point, PupilPosition};

/// Raw gaze estimation: two pupil centers in, one normalized point out.
///
/// Pure functions of their inputs so direction conventions can be regression
/// tested without a camera.

/// Midpoint of both pupils, normalized by the frame dimensions to
/// [0,1] x [0,1]. `mirror` flips the horizontal axis so the on-screen point
/// moves the way the user does, matching the usual selfie-camera convention.
pub fn estimate_raw(
    left: PupilPosition,
    right: PupilPosition,
    frame_width: u32,
    frame_height: u32,
    mirror: bool,
) -> Point {
    let mid = Point::new(
        (left.point.x + right.point.x) / 2.0,
        (left.point.y + right.point.y) / 2.0,
    );

    let mut x = mid.x / frame_width.max(1) as f32;
    let y = mid.y / frame_height.max(1) as f32;
    if mirror {
        x = 1.0 - x;
    }

    Point::new(x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
}

/// Scale a normalized gaze point to screen pixels.
pub fn to_screen(normalized: Point, screen_width: f32, screen_height: f32) -> Point {
    Point::new(normalized.x * screen_width, normalized.y * screen_height)
}

/// Combined sample confidence from the two pupil scores, halved when the eye
/// boxes were synthesized rather than detected.
pub fn sample_confidence(left: PupilPosition, right: PupilPosition, synthesized: bool) -> f32 {
    let base = left.confidence.min(right.confidence);
    if synthesized {
        base * 0.5
    } else {
        base
    }
}
