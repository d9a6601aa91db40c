use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of points in the anatomical landmark ordering consumed here.
pub const LANDMARK_COUNT: usize = 68;

const RIGHT_EYE: Range<usize> = 36..42;
const LEFT_EYE: Range<usize> = 42..48;
const NOSE_TIP: Range<usize> = 32..36;
const MOUTH: Range<usize> = 48..68;

/// A 2D landmark position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(self, other: Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Facial landmarks for one detected face, in the 68-point ordering
/// (jaw 0-16, brows 17-26, nose 27-35, right eye 36-41, left eye 42-47,
/// mouth 48-67).
///
/// Region accessors return `None` when the detector produced fewer points
/// than the region needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Whether the full 68-point set is present.
    pub fn is_complete(&self) -> bool {
        self.points.len() >= LANDMARK_COUNT
    }

    pub fn right_eye(&self) -> Option<&[Point]> {
        self.points.get(RIGHT_EYE)
    }

    pub fn left_eye(&self) -> Option<&[Point]> {
        self.points.get(LEFT_EYE)
    }

    pub fn mouth(&self) -> Option<&[Point]> {
        self.points.get(MOUTH)
    }

    /// Mean of the lower nose points, used as the head-motion anchor.
    pub fn nose_center(&self) -> Option<Point> {
        let nose = self.points.get(NOSE_TIP)?;
        let n = nose.len() as f32;
        let (sx, sy) = nose
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        let center = Point::new(sx / n, sy / n);
        center.is_finite().then_some(center)
    }
}

/// Dimensions of the frame the landmarks were detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Landmarks of the single face found in a frame, with the frame geometry
/// needed to normalize head displacement.
#[derive(Debug, Clone)]
pub struct GestureSample {
    pub landmarks: Landmarks,
    pub frame: FrameSize,
    pub timestamp: DateTime<Utc>,
}
