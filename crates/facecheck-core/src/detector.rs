use image::RgbImage;
use thiserror::Error;

use crate::types::Landmarks;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("landmark request failed: {0}")]
    Request(String),
    #[error("malformed landmark response: {0}")]
    Malformed(String),
}

/// Facial landmark detector injected into the liveness pipeline.
///
/// Returns one [`Landmarks`] entry per detected face, in the 68-point
/// ordering. Implementations may block; callers bound the wait.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Landmarks>, DetectorError>;
}
