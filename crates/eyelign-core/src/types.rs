use serde::{Deserialize, Serialize};

/// Integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Translate by `offset` in both axes.
    pub fn shifted(self, offset: i32) -> Self {
        Self::new(self.x + offset, self.y + offset)
    }

    /// Multiply both coordinates by `factor`, truncating toward zero.
    pub fn scaled(self, factor: f64) -> Self {
        Self::new(
            (self.x as f64 * factor) as i32,
            (self.y as f64 * factor) as i32,
        )
    }
}

/// Both eye centers of one face. Left is the eye nearer the image's left edge.
///
/// Either both points exist or neither does; records hold `Option<EyePair>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EyePair {
    pub left: Point,
    pub right: Point,
}

impl EyePair {
    pub const fn new(left: Point, right: Point) -> Self {
        Self { left, right }
    }

    /// Horizontal distance from the left to the right eye. Negative when swapped.
    pub fn x_distance(&self) -> i32 {
        self.right.x - self.left.x
    }

    pub fn y_distance(&self) -> i32 {
        self.right.y - self.left.y
    }

    pub fn shifted(self, offset: i32) -> Self {
        Self::new(self.left.shifted(offset), self.right.shifted(offset))
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.left.scaled(factor), self.right.scaled(factor))
    }
}

/// Output image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Landmarks for one detected face, as returned by a [`LandmarkDetector`].
///
/// Each eye is a cluster of sub-pixel points (a 68-point model reports six
/// per eye, SCRFD reports one). The eye center is the cluster centroid.
///
/// [`LandmarkDetector`]: crate::detector::LandmarkDetector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: Vec<(f32, f32)>,
    pub right_eye: Vec<(f32, f32)>,
}

impl FaceLandmarks {
    /// Resolve both clusters to integer eye centers.
    ///
    /// Returns `None` if either cluster is empty or not finite.
    pub fn eye_centers(&self) -> Option<EyePair> {
        Some(EyePair::new(
            centroid(&self.left_eye)?,
            centroid(&self.right_eye)?,
        ))
    }
}

/// Average x and average y of a point cluster, truncated to integers.
fn centroid(points: &[(f32, f32)]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0f64, 0.0f64), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
    let (cx, cy) = (sx / n, sy / n);
    if !cx.is_finite() || !cy.is_finite() {
        return None;
    }
    Some(Point::new(cx as i32, cy as i32))
}
