use serde::Deserialize;
use std::time::Duration;

use facecheck_core::{DetectorError, LandmarkDetector, Landmarks, Point};
use image::RgbImage;

use crate::frame::encode_jpeg;

#[derive(Deserialize)]
struct DetectorResponse {
    faces: Vec<DetectedFace>,
}

#[derive(Deserialize)]
struct DetectedFace {
    landmarks: Vec<[f32; 2]>,
}

/// Landmark detector served by an external HTTP endpoint.
///
/// POSTs the frame as JPEG and expects
/// `{"faces": [{"landmarks": [[x, y], ...]}, ...]}` with 68 points per face.
pub struct HttpLandmarkDetector {
    agent: ureq::Agent,
    url: String,
}

impl HttpLandmarkDetector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            url: url.into(),
        }
    }
}

impl LandmarkDetector for HttpLandmarkDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Landmarks>, DetectorError> {
        let jpeg = encode_jpeg(frame).map_err(|e| DetectorError::Encode(e.to_string()))?;

        let mut response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "image/jpeg")
            .send(&jpeg[..])
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| DetectorError::Request(e.to_string()))?;

        parse_faces(&body)
    }
}

fn parse_faces(body: &str) -> Result<Vec<Landmarks>, DetectorError> {
    let response: DetectorResponse =
        serde_json::from_str(body).map_err(|e| DetectorError::Malformed(e.to_string()))?;
    Ok(response
        .faces
        .into_iter()
        .map(|face| {
            Landmarks::new(
                face.landmarks
                    .into_iter()
                    .map(|[x, y]| Point::new(x, y))
                    .collect(),
            )
        })
        .collect())
}
