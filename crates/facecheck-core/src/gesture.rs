//! Gesture ratios computed from facial landmark geometry.
//!
//! Each challenge reduces the landmark set to a single scalar:
//!
//! - **EAR** (eye aspect ratio) falls towards zero as the eyelid closes.
//! - **MAR** (mouth aspect ratio) rises as the mouth opens.
//! - **Displacement ratios** measure nose movement between two frames,
//!   normalized by half the frame height (nod) or width (shake).
//!
//! All ratio functions are total: missing points, zero denominators and
//! non-finite coordinates yield `0.0` instead of panicking or producing NaN.

use crate::types::{FrameSize, Landmarks, Point};

/// Default EAR below which the eyes count as closed.
pub const DEFAULT_EAR_THRESHOLD: f32 = 0.20;
/// Default MAR above which the mouth counts as open.
pub const DEFAULT_MAR_THRESHOLD: f32 = 0.50;
/// Default vertical nose displacement (fraction of half-height) for a nod.
pub const DEFAULT_NOD_THRESHOLD: f32 = 0.03;
/// Default horizontal nose displacement (fraction of half-width) for a shake.
pub const DEFAULT_SHAKE_THRESHOLD: f32 = 0.03;

fn safe_ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    let ratio = numerator / denominator;
    if ratio.is_finite() {
        ratio
    } else {
        0.0
    }
}

/// Eye aspect ratio over six eye points `p1..p6`:
/// `(|p2 - p6| + |p3 - p5|) / (2 * |p1 - p4|)`.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    let [p1, p2, p3, p4, p5, p6] = match eye {
        [a, b, c, d, e, f, ..] => [*a, *b, *c, *d, *e, *f],
        _ => return 0.0,
    };
    let vertical = p2.distance(p6) + p3.distance(p5);
    safe_ratio(vertical, 2.0 * p1.distance(p4))
}

/// Mouth aspect ratio over the mouth contour `m` (at least 10 points):
/// `(|m[2] - m[9]| + |m[4] - m[7]|) / (2 * |m[0] - m[6]|)`.
pub fn mouth_aspect_ratio(mouth: &[Point]) -> f32 {
    if mouth.len() < 10 {
        return 0.0;
    }
    let vertical = mouth[2].distance(mouth[9]) + mouth[4].distance(mouth[7]);
    safe_ratio(vertical, 2.0 * mouth[0].distance(mouth[6]))
}

/// `|prior.y - current.y| / (frame_height / 2)`.
pub fn vertical_displacement_ratio(frame_height: u32, prior: Point, current: Point) -> f32 {
    safe_ratio((prior.y - current.y).abs(), frame_height as f32 / 2.0)
}

/// `|prior.x - current.x| / (frame_width / 2)`.
pub fn horizontal_displacement_ratio(frame_width: u32, prior: Point, current: Point) -> f32 {
    safe_ratio((prior.x - current.x).abs(), frame_width as f32 / 2.0)
}

/// Outcome of a gesture predicate: whether it fired, and the raw ratio for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureReading {
    pub triggered: bool,
    pub ratio: f32,
}

impl GestureReading {
    pub const IDLE: GestureReading = GestureReading {
        triggered: false,
        ratio: 0.0,
    };
}

/// Trigger thresholds for the four gesture predicates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureThresholds {
    pub ear: f32,
    pub mar: f32,
    pub nod: f32,
    pub shake: f32,
}

impl Default for GestureThresholds {
    fn default() -> Self {
        Self {
            ear: DEFAULT_EAR_THRESHOLD,
            mar: DEFAULT_MAR_THRESHOLD,
            nod: DEFAULT_NOD_THRESHOLD,
            shake: DEFAULT_SHAKE_THRESHOLD,
        }
    }
}

impl GestureThresholds {
    /// Blink fires when the mean EAR of both eyes drops below the threshold.
    pub fn blink(&self, landmarks: &Landmarks) -> GestureReading {
        if !landmarks.is_complete() {
            return GestureReading::IDLE;
        }
        let (Some(left), Some(right)) = (landmarks.left_eye(), landmarks.right_eye()) else {
            return GestureReading::IDLE;
        };
        let ear = (eye_aspect_ratio(left) + eye_aspect_ratio(right)) / 2.0;
        GestureReading {
            triggered: ear < self.ear,
            ratio: ear,
        }
    }

    /// Mouth-open fires when MAR rises above the threshold.
    pub fn mouth_open(&self, landmarks: &Landmarks) -> GestureReading {
        if !landmarks.is_complete() {
            return GestureReading::IDLE;
        }
        let Some(mouth) = landmarks.mouth() else {
            return GestureReading::IDLE;
        };
        let mar = mouth_aspect_ratio(mouth);
        GestureReading {
            triggered: mar > self.mar,
            ratio: mar,
        }
    }

    pub fn nod(&self, frame: FrameSize, prior: Point, current: Point) -> GestureReading {
        let ratio = vertical_displacement_ratio(frame.height, prior, current);
        GestureReading {
            triggered: ratio > self.nod,
            ratio,
        }
    }

    pub fn shake(&self, frame: FrameSize, prior: Point, current: Point) -> GestureReading {
        let ratio = horizontal_displacement_ratio(frame.width, prior, current);
        GestureReading {
            triggered: ratio > self.shake,
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LANDMARK_COUNT;

    fn open_eye(x: f32, y: f32) -> [Point; 6] {
        [
            Point::new(x, y),
            Point::new(x + 10.0, y - 6.0),
            Point::new(x + 20.0, y - 6.0),
            Point::new(x + 30.0, y),
            Point::new(x + 20.0, y + 6.0),
            Point::new(x + 10.0, y + 6.0),
        ]
    }

    fn face_with(eye_half_height: f32, lip_gap: f32) -> Landmarks {
        let mut points = vec![Point::default(); LANDMARK_COUNT];
        for (base, x) in [(36usize, 100.0f32), (42, 180.0)] {
            for (i, mut p) in open_eye(x, 120.0).into_iter().enumerate() {
                if p.y != 120.0 {
                    p.y = 120.0 + (p.y - 120.0).signum() * eye_half_height;
                }
                points[base + i] = p;
            }
        }
        points[48] = Point::new(120.0, 220.0);
        points[54] = Point::new(180.0, 220.0);
        points[50] = Point::new(140.0, 220.0 - lip_gap);
        points[57] = Point::new(140.0, 220.0 + lip_gap);
        points[52] = Point::new(160.0, 220.0 - lip_gap);
        points[55] = Point::new(160.0, 220.0 + lip_gap);
        Landmarks::new(points)
    }

    #[test]
    fn test_ear_known_geometry() {
        // vertical: 12 + 12, horizontal: 30 → 24 / 60 = 0.4
        let ear = eye_aspect_ratio(&open_eye(0.0, 0.0));
        assert!((ear - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_ear_zero_corner_distance() {
        let mut eye = open_eye(0.0, 0.0);
        eye[3] = eye[0];
        assert_eq!(eye_aspect_ratio(&eye), 0.0);
        assert_eq!(eye_aspect_ratio(&[Point::default(); 6]), 0.0);
    }

    #[test]
    fn test_ear_malformed_input() {
        assert_eq!(eye_aspect_ratio(&[]), 0.0);
        assert_eq!(eye_aspect_ratio(&open_eye(0.0, 0.0)[..5]), 0.0);
        let mut eye = open_eye(0.0, 0.0);
        eye[1] = Point::new(f32::NAN, 0.0);
        assert_eq!(eye_aspect_ratio(&eye), 0.0);
        eye[0] = Point::new(f32::INFINITY, 0.0);
        assert_eq!(eye_aspect_ratio(&eye), 0.0);
    }

    #[test]
    fn test_mar_known_geometry() {
        let face = face_with(6.0, 15.0);
        // vertical: 30 + 30, horizontal: 60 → 60 / 120 = 0.5
        let mar = mouth_aspect_ratio(face.mouth().unwrap());
        assert!((mar - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mar_degenerate() {
        assert_eq!(mouth_aspect_ratio(&[Point::default(); 9]), 0.0);
        assert_eq!(mouth_aspect_ratio(&[Point::default(); 20]), 0.0);
    }

    #[test]
    fn test_displacement_ratios() {
        let prior = Point::new(320.0, 240.0);
        let current = Point::new(329.6, 247.2);
        assert!((vertical_displacement_ratio(480, prior, current) - 0.03).abs() < 1e-5);
        assert!((horizontal_displacement_ratio(640, prior, current) - 0.03).abs() < 1e-5);
        assert_eq!(vertical_displacement_ratio(0, prior, current), 0.0);
        assert_eq!(horizontal_displacement_ratio(0, prior, current), 0.0);
    }

    #[test]
    fn test_blink_predicate() {
        let t = GestureThresholds::default();
        let open = t.blink(&face_with(6.0, 2.0));
        assert!(!open.triggered);
        assert!((open.ratio - 0.4).abs() < 1e-6);

        let closed = t.blink(&face_with(1.0, 2.0));
        assert!(closed.triggered);
        assert!(closed.ratio < DEFAULT_EAR_THRESHOLD);
    }

    #[test]
    fn test_mouth_predicate() {
        let t = GestureThresholds::default();
        assert!(!t.mouth_open(&face_with(6.0, 3.0)).triggered);
        assert!(t.mouth_open(&face_with(6.0, 20.0)).triggered);
    }

    #[test]
    fn test_incomplete_landmarks_never_trigger() {
        // A zeroed partial set would read EAR 0.0, which must not count as a blink
        let t = GestureThresholds::default();
        let partial = Landmarks::new(vec![Point::default(); 48]);
        assert_eq!(t.blink(&partial), GestureReading::IDLE);
        assert_eq!(t.mouth_open(&partial), GestureReading::IDLE);
    }

    #[test]
    fn test_head_motion_predicates() {
        let t = GestureThresholds::default();
        let frame = FrameSize {
            width: 640,
            height: 480,
        };
        let prior = Point::new(320.0, 240.0);
        assert!(t.nod(frame, prior, Point::new(320.0, 250.0)).triggered);
        assert!(!t.nod(frame, prior, Point::new(340.0, 243.0)).triggered);
        assert!(t.shake(frame, prior, Point::new(335.0, 240.0)).triggered);
        assert!(!t.shake(frame, prior, Point::new(325.0, 260.0)).triggered);
    }
}
