use std::sync::Arc;
use zbus::interface;

use crate::service::{FrameError, LivenessService};
use crate::store::SessionBackend;

pub const BUS_NAME: &str = "org.freedesktop.FaceCheck1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceCheck1";

/// D-Bus interface for the FaceCheck liveness daemon.
///
/// Bus name: org.freedesktop.FaceCheck1
/// Object path: /org/freedesktop/FaceCheck1
pub struct FaceCheckService {
    pub service: Arc<LivenessService<SessionBackend>>,
}

/// Map a frame failure onto a distinct D-Bus error so clients can tell
/// retryable input problems from terminal session outcomes.
fn to_fdo(err: FrameError) -> zbus::fdo::Error {
    let msg = err.to_string();
    match err {
        FrameError::UnreadableImage(_) => zbus::fdo::Error::InvalidArgs(msg),
        FrameError::Timeout => zbus::fdo::Error::TimedOut(msg),
        FrameError::Reflection | FrameError::ReplayLike => zbus::fdo::Error::AccessDenied(msg),
        FrameError::SessionNotFound(_) => zbus::fdo::Error::UnknownObject(msg),
        FrameError::Snapshot(_) | FrameError::Store(_) => zbus::fdo::Error::Failed(msg),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.FaceCheck1")]
impl FaceCheckService {
    /// Submit one camera frame for a session. An empty id starts a new session.
    ///
    /// Returns the per-frame response as JSON.
    async fn submit_frame(&self, session_id: &str, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        let session_id = (!session_id.is_empty()).then_some(session_id);
        tracing::debug!(session_id = ?session_id, bytes = frame.len(), "submit_frame requested");

        let response = self
            .service
            .submit_frame(session_id, &frame)
            .await
            .map_err(|e| {
                match &e {
                    FrameError::Store(_) | FrameError::Snapshot(_) => {
                        tracing::error!(error = %e, "submit_frame failed")
                    }
                    _ => tracing::info!(error = %e, "submit_frame rejected"),
                }
                to_fdo(e)
            })?;
        to_json(&response)
    }

    /// Return the current view of a session as JSON without consuming a frame.
    async fn query_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(session_id, "query_session requested");
        let response = self.service.query(session_id).await.map_err(to_fdo)?;
        to_json(&response)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}
