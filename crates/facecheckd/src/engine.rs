use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use facecheck_core::{DetectorError, LandmarkDetector, Landmarks};
use image::RgbImage;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("detector did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
struct DetectRequest {
    frame: RgbImage,
    reply: oneshot::Sender<Result<Vec<Landmarks>, DetectorError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<DetectRequest>,
}

impl EngineHandle {
    /// Run landmark detection on `frame`, waiting at most `timeout` for the
    /// engine to accept and answer the request.
    pub async fn detect(
        &self,
        frame: RgbImage,
        timeout: Duration,
    ) -> Result<Vec<Landmarks>, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(DetectRequest {
                    frame,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let faces = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
            Ok::<_, EngineError>(faces)
        };
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| EngineError::TimedOut(timeout))?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The detector is owned by the thread and serves requests one at a time.
/// Requests whose caller already gave up are skipped.
pub fn spawn_engine<D>(mut detector: D) -> Result<EngineHandle, EngineError>
where
    D: LandmarkDetector + 'static,
{
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(4);

    std::thread::Builder::new()
        .name("facecheck-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.reply.is_closed() {
                    tracing::debug!("engine: skipping abandoned request");
                    continue;
                }
                let result = detector.detect(&req.frame);
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecheck_core::Point;

    struct FixedDetector(usize);

    impl LandmarkDetector for FixedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Landmarks>, DetectorError> {
            Ok(vec![Landmarks::new(vec![Point::default(); 68]); self.0])
        }
    }

    struct SlowDetector;

    impl LandmarkDetector for SlowDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Landmarks>, DetectorError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Vec::new())
        }
    }

    struct FailingDetector;

    impl LandmarkDetector for FailingDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<Landmarks>, DetectorError> {
            Err(DetectorError::Request("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_detect_returns_faces() {
        let engine = spawn_engine(FixedDetector(2)).unwrap();
        let faces = engine
            .detect(RgbImage::new(8, 8), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(faces.len(), 2);
    }

    #[tokio::test]
    async fn test_detect_times_out() {
        let engine = spawn_engine(SlowDetector).unwrap();
        let err = engine
            .detect(RgbImage::new(8, 8), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_detector_error_propagates() {
        let engine = spawn_engine(FailingDetector).unwrap();
        let err = engine
            .detect(RgbImage::new(8, 8), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Detector(DetectorError::Request(_))));
    }
}
