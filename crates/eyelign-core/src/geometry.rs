//! Alignment geometry: rotation, safety border, scale and crop computed from
//! two eye points.
//!
//! All functions are pure. [`plan_alignment`] composes them in pipeline order
//! (border, rotate, scale, crop) into an [`AlignmentPlan`] which the renderer
//! realises on pixels.
//!
//! Coordinates are image coordinates: x grows to the right, y grows downward.
//! A positive rotation is counter-clockwise as seen on screen, about the left eye.

use crate::types::{EyePair, Point, TargetSize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("target size must be positive, got {width}x{height}")]
    InvalidTargetSize { width: u32, height: u32 },
    #[error("eye width must be within (0, 100] percent of the output width, got {0}")]
    InvalidEyeWidth(f64),
    #[error("right eye is not right of the left eye after rotation (x distance {0}px)")]
    DegenerateEyeDistance(i32),
}

/// Reject zero-sized output dimensions.
pub fn validate_target(target: TargetSize) -> Result<(), GeometryError> {
    if target.width == 0 || target.height == 0 {
        return Err(GeometryError::InvalidTargetSize {
            width: target.width,
            height: target.height,
        });
    }
    Ok(())
}

pub fn validate_eye_width(eye_width_pct: f64) -> Result<(), GeometryError> {
    if !(eye_width_pct > 0.0 && eye_width_pct <= 100.0) {
        return Err(GeometryError::InvalidEyeWidth(eye_width_pct));
    }
    Ok(())
}

/// Degrees of rotation that make the eye-to-eye line horizontal.
///
/// Rotating the image by the result about `left` puts `right` level with it
/// and to its right.
pub fn rotation_required(left: Point, right: Point) -> f64 {
    let dx = (left.x - right.x) as f64;
    let dy = (left.y - right.y) as f64;
    dx.atan2(dy).to_degrees().abs() - 90.0
}

/// Exact position of `point` after rotating the image by `degrees` about `pivot`.
fn rotate_about(pivot: (f64, f64), point: (f64, f64), degrees: f64) -> (f64, f64) {
    let x = point.0 - pivot.0;
    let y = point.1 - pivot.1;
    let (sin, cos) = degrees.to_radians().sin_cos();

    let rotated_y = y * cos - x * sin;
    let rotated_x = y * sin + x * cos;
    (rotated_x + pivot.0, rotated_y + pivot.1)
}

/// Where `point` lands after the image is rotated by `degrees` about `pivot`,
/// rounded to the nearest pixel.
pub fn point_after_rotation(pivot: Point, point: Point, degrees: f64) -> Point {
    let (x, y) = rotate_about(
        (pivot.x as f64, pivot.y as f64),
        (point.x as f64, point.y as f64),
        degrees,
    );
    Point::new(x.round() as i32, y.round() as i32)
}

/// Padding, in pixels on every side, that keeps all content inside the canvas
/// for any rotation about any interior point: the image diagonal.
pub fn safety_border(width: u32, height: u32) -> u32 {
    (width as f64).hypot(height as f64).ceil() as u32
}

/// Uniform scale that makes the eye distance `eye_width_pct` percent of the
/// output width.
pub fn scale_factor(
    x_eye_distance: i32,
    target_width: u32,
    eye_width_pct: f64,
) -> Result<f64, GeometryError> {
    if x_eye_distance <= 0 {
        return Err(GeometryError::DegenerateEyeDistance(x_eye_distance));
    }
    Ok(target_width as f64 * (eye_width_pct / 100.0) / x_eye_distance as f64)
}

/// Midpoint between the eyes: distance, halved (truncating toward zero), added
/// to the left eye. Not always equal to `(l + r) / 2` in integers.
pub fn eye_center(left: Point, right: Point) -> Point {
    Point::new(
        left.x + (right.x - left.x) / 2,
        left.y + (right.y - left.y) / 2,
    )
}

/// Half-open crop rectangle `[x0, x1) × [y0, y1)`. May extend past the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        (self.x1 - self.x0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y1 - self.y0) as u32
    }
}

/// A `target`-sized rectangle centered on `center`.
///
/// For odd dimensions the extra pixel goes to the right/bottom.
pub fn crop_rect(center: Point, target: TargetSize) -> CropRect {
    let x0 = center.x - (target.width / 2) as i32;
    let y0 = center.y - (target.height / 2) as i32;
    CropRect {
        x0,
        y0,
        x1: x0 + target.width as i32,
        y1: y0 + target.height as i32,
    }
}

/// Complete transformation recipe for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentPlan {
    /// Padding added on every side before rotating.
    pub border: u32,
    pub rotation_degrees: f64,
    /// Left eye in bordered coordinates; the rotation pivot.
    pub pivot: Point,
    /// Eyes in bordered coordinates after rotation.
    pub rotated: EyePair,
    pub scale: f64,
    /// Eyes after rotation and scaling.
    pub scaled: EyePair,
    pub center: Point,
    /// Crop in the scaled, rotated, bordered image.
    pub crop: CropRect,
}

/// Compose border, rotation, scale and crop for an image of the given size.
pub fn plan_alignment(
    eyes: EyePair,
    image_width: u32,
    image_height: u32,
    target: TargetSize,
    eye_width_pct: f64,
) -> Result<AlignmentPlan, GeometryError> {
    validate_target(target)?;
    validate_eye_width(eye_width_pct)?;

    let border = safety_border(image_width, image_height);
    let bordered = eyes.shifted(border as i32);

    let rotation_degrees = rotation_required(bordered.left, bordered.right);
    let rotated = EyePair::new(
        bordered.left,
        point_after_rotation(bordered.left, bordered.right, rotation_degrees),
    );

    let scale = scale_factor(rotated.x_distance(), target.width, eye_width_pct)?;
    let scaled = rotated.scaled(scale);
    let center = eye_center(scaled.left, scaled.right);

    Ok(AlignmentPlan {
        border,
        rotation_degrees,
        pivot: bordered.left,
        rotated,
        scale,
        scaled,
        center,
        crop: crop_rect(center, target),
    })
}

impl AlignmentPlan {
    /// Map a source-image position to output-image coordinates without rounding.
    pub fn source_to_output(&self, x: f64, y: f64) -> (f64, f64) {
        let border = self.border as f64;
        let (rx, ry) = rotate_about(
            (self.pivot.x as f64, self.pivot.y as f64),
            (x + border, y + border),
            self.rotation_degrees,
        );
        (
            rx * self.scale - self.crop.x0 as f64,
            ry * self.scale - self.crop.y0 as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_level_eyes_need_no_rotation() {
        for (l, r) in [
            (Point::new(100, 100), Point::new(140, 100)),
            (Point::new(0, 0), Point::new(1, 0)),
            (Point::new(-50, 3000), Point::new(900, 3000)),
        ] {
            assert!(rotation_required(l, r).abs() < 1e-9);
        }
    }

    #[test]
    fn test_diagonal_eyes_need_45_degrees() {
        // Right eye lower on screen: counter-clockwise turn lifts it.
        let down = rotation_required(Point::new(0, 0), Point::new(10, 10));
        assert!(close(down, 45.0, 1e-9), "got {down}");
        let up = rotation_required(Point::new(0, 0), Point::new(10, -10));
        assert!(close(up, -45.0, 1e-9), "got {up}");
    }

    #[test]
    fn test_rotation_levels_right_eye() {
        let cases = [
            (Point::new(100, 100), Point::new(180, 130)),
            (Point::new(100, 100), Point::new(180, 60)),
            (Point::new(100, 100), Point::new(100, 140)),
            (Point::new(100, 100), Point::new(100, 60)),
            (Point::new(0, 0), Point::new(30, 40)),
        ];
        for (l, r) in cases {
            let deg = rotation_required(l, r);
            let (x, y) = rotate_about(
                (l.x as f64, l.y as f64),
                (r.x as f64, r.y as f64),
                deg,
            );
            let dist = (((r.x - l.x).pow(2) + (r.y - l.y).pow(2)) as f64).sqrt();
            assert!(close(y, l.y as f64, 1e-9), "{l:?} {r:?}: y={y}");
            assert!(close(x - l.x as f64, dist, 1e-9), "{l:?} {r:?}: x={x}");
        }
    }

    #[test]
    fn test_rotate_about_round_trip_exact() {
        let pivot = (12.0, -7.0);
        for &(point, deg) in &[((30.0, 40.0), 30.0), ((-5.0, 8.0), -71.5), ((400.0, 2.0), 179.0)] {
            let there = rotate_about(pivot, point, deg);
            let back = rotate_about(pivot, there, -deg);
            assert!(close(back.0, point.0, 1e-9) && close(back.1, point.1, 1e-9));
        }
    }

    #[test]
    fn test_point_after_rotation_round_trip_within_a_pixel() {
        let pivot = Point::new(0, 0);
        for &(point, deg) in &[
            (Point::new(30, 40), 30.0),
            (Point::new(80, 30), 20.556),
            (Point::new(-15, 64), -12.0),
            (Point::new(40, 0), 0.0),
        ] {
            let there = point_after_rotation(pivot, point, deg);
            let back = point_after_rotation(pivot, there, -deg);
            assert!((back.x - point.x).abs() <= 1, "{point:?} -> {back:?}");
            assert!((back.y - point.y).abs() <= 1, "{point:?} -> {back:?}");
        }
    }

    #[test]
    fn test_point_after_rotation_round_trip_sweep() {
        let pivot = Point::new(7, -3);
        for deg in [-71.5, -12.0, 5.0, 21.8, 33.0, 45.0] {
            for x in (-60..=60).step_by(3) {
                for y in (-60..=60).step_by(3) {
                    let point = Point::new(x, y);
                    let there = point_after_rotation(pivot, point, deg);
                    let back = point_after_rotation(pivot, there, -deg);
                    assert!(
                        (back.x - x).abs() <= 1 && (back.y - y).abs() <= 1,
                        "{point:?} at {deg} -> {back:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let p = point_after_rotation(Point::new(5, 5), Point::new(45, 5), 0.0);
        assert_eq!(p, Point::new(45, 5));
    }

    #[test]
    fn test_safety_border_is_diagonal() {
        assert_eq!(safety_border(300, 400), 500);
        assert_eq!(safety_border(1, 1), 2);
        assert_eq!(safety_border(0, 0), 0);
    }

    #[test]
    fn test_scale_factor() {
        assert!(close(scale_factor(40, 400, 20.0).unwrap(), 2.0, 1e-12));
        assert!(close(scale_factor(200, 400, 25.0).unwrap(), 0.5, 1e-12));
    }

    #[test]
    fn test_scale_factor_rejects_non_positive_distance() {
        assert_eq!(
            scale_factor(0, 400, 20.0),
            Err(GeometryError::DegenerateEyeDistance(0))
        );
        assert_eq!(
            scale_factor(-12, 400, 20.0),
            Err(GeometryError::DegenerateEyeDistance(-12))
        );
    }

    #[test]
    fn test_eye_center_halves_distance_first() {
        assert_eq!(eye_center(Point::new(100, 100), Point::new(140, 100)), Point::new(120, 100));
        // Distance -5 halves to -2 (toward zero), so 10 + -2 = 8 rather than 15 / 2 = 7.
        assert_eq!(eye_center(Point::new(10, 10), Point::new(5, 5)), Point::new(8, 8));
    }

    #[test]
    fn test_crop_rect_has_target_size() {
        let rect = crop_rect(Point::new(1090, 1050), TargetSize::new(400, 600));
        assert_eq!(rect, CropRect { x0: 890, y0: 750, x1: 1290, y1: 1350 });

        let odd = crop_rect(Point::new(10, 10), TargetSize::new(5, 3));
        assert_eq!((odd.width(), odd.height()), (5, 3));
        assert_eq!((odd.x0, odd.y0), (8, 9));
    }

    #[test]
    fn test_plan_for_level_eyes() {
        let eyes = EyePair::new(Point::new(100, 100), Point::new(140, 100));
        let plan = plan_alignment(eyes, 300, 400, TargetSize::new(400, 600), 20.0).unwrap();

        assert_eq!(plan.border, 500);
        assert!(plan.rotation_degrees.abs() < 1e-9);
        assert!(close(plan.scale, 2.0, 1e-12));
        assert_eq!(plan.scaled.left, Point::new(1200, 1200));
        assert_eq!(plan.scaled.right, Point::new(1280, 1200));
        assert_eq!((plan.crop.width(), plan.crop.height()), (400, 600));

        // Eyes land 80px apart, centered horizontally, on the vertical middle.
        let (lx, ly) = plan.source_to_output(100.0, 100.0);
        let (rx, ry) = plan.source_to_output(140.0, 100.0);
        assert!(close(lx, 160.0, 1e-6) && close(ly, 300.0, 1e-6));
        assert!(close(rx, 240.0, 1e-6) && close(ry, 300.0, 1e-6));
    }

    #[test]
    fn test_plan_levels_tilted_eyes() {
        let eyes = EyePair::new(Point::new(90, 120), Point::new(170, 150));
        let plan = plan_alignment(eyes, 256, 256, TargetSize::new(200, 200), 40.0).unwrap();

        let (lx, ly) = plan.source_to_output(90.0, 120.0);
        let (rx, ry) = plan.source_to_output(170.0, 150.0);
        assert!(close(ly, ry, 1e-6), "eyes not level: {ly} vs {ry}");
        assert!(rx > lx);
        // Integer truncation in the plan costs at most a couple of pixels.
        assert!(close(rx - lx, 80.0, 2.0), "eye distance {}", rx - lx);
        assert!(close((lx + rx) / 2.0, 100.0, 2.0));
        assert!(close(ly, 100.0, 2.0));
    }

    #[test]
    fn test_plan_rejects_swapped_eyes() {
        let eyes = EyePair::new(Point::new(100, 100), Point::new(60, 130));
        let err = plan_alignment(eyes, 300, 300, TargetSize::new(100, 100), 20.0).unwrap_err();
        assert!(matches!(err, GeometryError::DegenerateEyeDistance(d) if d <= 0));
    }

    #[test]
    fn test_plan_rejects_bad_configuration() {
        let eyes = EyePair::new(Point::new(100, 100), Point::new(140, 100));
        assert_eq!(
            plan_alignment(eyes, 300, 300, TargetSize::new(0, 600), 20.0),
            Err(GeometryError::InvalidTargetSize { width: 0, height: 600 })
        );
        assert_eq!(
            plan_alignment(eyes, 300, 300, TargetSize::new(400, 600), 0.0),
            Err(GeometryError::InvalidEyeWidth(0.0))
        );
    }
}
