//! facecheck-core — challenge-response liveness verification.
//!
//! Walks a subject through a randomized sequence of gesture challenges
//! (blink, open mouth, nod, shake head), validated per frame from 68-point
//! facial landmarks and combined with still-image spoof heuristics and a
//! protocol timeout. Landmark detection itself is an injected capability
//! ([`LandmarkDetector`]); session persistence belongs to the caller.

pub mod detector;
pub mod gesture;
pub mod machine;
pub mod session;
pub mod spoof;
pub mod types;

mod encoding;

pub use detector::{DetectorError, LandmarkDetector};
pub use gesture::{GestureReading, GestureThresholds};
pub use machine::{
    ChallengeMachine, FaceObservation, FailureReason, MachineConfig, Notice, RequiredDetections,
    Screening, SessionStatus, StepReport,
};
pub use session::{Challenge, SessionState};
pub use spoof::{
    ReflectionGuard, ReflectionReport, TextureDynamicsGuard, TextureReport, TimeoutGuard,
};
pub use types::{FrameSize, GestureSample, Landmarks, Point};
