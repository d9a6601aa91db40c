use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use facecheck_core::{
    Challenge, ChallengeMachine, FaceObservation, FailureReason, Notice, Screening, SessionState,
    SessionStatus,
};

use crate::engine::EngineHandle;
use crate::frame::{decode_frame, encode_jpeg, frame_size};
use crate::locks::SessionLocks;
use crate::store::{SessionStore, StoreError};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("unreadable image: {0}")]
    UnreadableImage(#[source] image::ImageError),
    #[error("{}", FailureReason::Timeout)]
    Timeout,
    #[error("{}", FailureReason::Reflection)]
    Reflection,
    #[error("{}", FailureReason::ReplayLike)]
    ReplayLike,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("failed to capture first-frame snapshot: {0}")]
    Snapshot(#[source] image::ImageError),
    #[error("session store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<FailureReason> for FrameError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Timeout => FrameError::Timeout,
            FailureReason::Reflection => FrameError::Reflection,
            FailureReason::ReplayLike => FrameError::ReplayLike,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub name: &'static str,
    pub prompt: &'static str,
    pub done: bool,
}

/// Per-frame answer returned to the client as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub success: bool,
    pub session_id: String,
    pub current_step: Option<&'static str>,
    pub current_prompt: String,
    pub steps: Vec<StepView>,
    pub all_passed: bool,
    pub message: String,
    /// Base64 JPEG of the session's first frame, only once every step passed.
    pub final_snapshot: Option<String>,
}

impl LivenessResponse {
    fn from_state(state: &SessionState, message: String) -> Self {
        let all_passed = state.is_complete();
        let current = state.current_challenge();
        Self {
            success: true,
            session_id: state.id().to_string(),
            current_step: current.map(Challenge::name),
            current_prompt: current.map_or_else(
                || Notice::AllPassed.message(),
                |challenge| challenge.prompt().to_string(),
            ),
            steps: state
                .steps()
                .iter()
                .zip(state.done_flags())
                .map(|(challenge, done)| StepView {
                    name: challenge.name(),
                    prompt: challenge.prompt(),
                    done: *done,
                })
                .collect(),
            all_passed,
            message,
            final_snapshot: all_passed.then(|| STANDARD.encode(state.first_frame())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub live_sessions: u64,
    pub active_requests: usize,
    pub protocol_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub detector_timeout_ms: u64,
    pub texture_guard: bool,
    pub ear_threshold: f32,
    pub mar_threshold: f32,
    pub nod_threshold: f32,
    pub shake_threshold: f32,
}

/// Drives sessions frame by frame: load, guard, detect, advance, save.
pub struct LivenessService<S> {
    machine: ChallengeMachine,
    store: S,
    engine: EngineHandle,
    locks: SessionLocks,
    session_ttl: Duration,
    detector_timeout: Duration,
}

impl<S: SessionStore> LivenessService<S> {
    pub fn new(
        machine: ChallengeMachine,
        store: S,
        engine: EngineHandle,
        session_ttl: Duration,
        detector_timeout: Duration,
    ) -> Self {
        Self {
            machine,
            store,
            engine,
            locks: SessionLocks::new(),
            session_ttl,
            detector_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one frame for `session_id`, creating the session when the id
    /// is absent, empty or unknown.
    pub async fn submit_frame(
        &self,
        session_id: Option<&str>,
        frame: &[u8],
    ) -> Result<LivenessResponse, FrameError> {
        let image = decode_frame(frame).map_err(FrameError::UnreadableImage)?;
        let id = match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let _guard = self.locks.acquire(&id).await;
        let now = Utc::now();

        let mut state = match self.store.get(&id).await? {
            Some(state) => state,
            None => {
                let snapshot = encode_jpeg(&image).map_err(FrameError::Snapshot)?;
                let state =
                    SessionState::with_random_order(&id, snapshot, now, &mut rand::thread_rng());
                tracing::info!(session_id = %id, steps = ?state.steps(), "session created");
                state
            }
        };

        match self.machine.screen(&mut state, &image, now) {
            Screening::Proceed => {}
            Screening::Completed => {
                tracing::debug!(session_id = %id, "frame after completion");
                return Ok(LivenessResponse::from_state(&state, Notice::AllPassed.message()));
            }
            Screening::Failed(reason) => {
                self.store.set(&id, &state, self.session_ttl).await?;
                tracing::info!(session_id = %id, reason = ?reason, "session failed");
                return Err(reason.into());
            }
        }

        let size = frame_size(&image);
        let observation = match self.engine.detect(image, self.detector_timeout).await {
            Ok(faces) => FaceObservation::from_faces(faces, size, now),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "landmark detection unavailable");
                FaceObservation::Unavailable
            }
        };

        let report = self.machine.advance(&mut state, observation);
        tracing::debug!(
            session_id = %id,
            step = ?report.challenge,
            ratio = report.reading.ratio,
            triggered = report.reading.triggered,
            debounce = state.debounce(),
            "frame evaluated"
        );
        match report.notice {
            Notice::StepPassed(challenge) => {
                tracing::info!(session_id = %id, step = ?challenge, "step passed");
            }
            Notice::AllPassed if report.advanced => {
                tracing::info!(session_id = %id, "all steps passed");
            }
            _ => {}
        }

        self.store.set(&id, &state, self.session_ttl).await?;
        Ok(LivenessResponse::from_state(&state, report.notice.message()))
    }

    /// Current view of a stored session, without consuming a frame.
    pub async fn query(&self, session_id: &str) -> Result<LivenessResponse, FrameError> {
        let state = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| FrameError::SessionNotFound(session_id.to_string()))?;

        Ok(match self.machine.status(&state, Utc::now()) {
            SessionStatus::Completed => {
                LivenessResponse::from_state(&state, Notice::AllPassed.message())
            }
            SessionStatus::Failed(reason) => LivenessResponse {
                success: false,
                ..LivenessResponse::from_state(&state, reason.to_string())
            },
            SessionStatus::InProgress(_) => LivenessResponse::from_state(&state, String::new()),
        })
    }

    pub async fn status(&self) -> Result<ServiceStatus, FrameError> {
        let config = self.machine.config();
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            live_sessions: self.store.count_live().await?,
            active_requests: self.locks.active(),
            protocol_timeout_secs: config.protocol_timeout.as_secs(),
            session_ttl_secs: self.session_ttl.as_secs(),
            detector_timeout_ms: u64::try_from(self.detector_timeout.as_millis())
                .unwrap_or(u64::MAX),
            texture_guard: config.texture.is_some(),
            ear_threshold: config.thresholds.ear,
            mar_threshold: config.thresholds.mar,
            nod_threshold: config.thresholds.nod,
            shake_threshold: config.thresholds.shake,
        })
    }
}
