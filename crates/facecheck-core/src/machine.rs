//! The challenge state machine.
//!
//! Every frame goes through two phases, split so the caller can run the
//! (slow, external) landmark detector in between without holding any
//! protocol logic of its own:
//!
//! 1. [`ChallengeMachine::screen`] — terminal-state replay, timeout and
//!    spoof guards. Anything other than [`Screening::Proceed`] ends the frame.
//! 2. [`ChallengeMachine::advance`] — feeds the detector's observation to the
//!    current step's gesture predicate, counts triggers and advances steps.
//!
//! Soft outcomes (no face, several faces, detector unavailable, predicate
//! not yet satisfied) never consume debounce and never touch step state.
//! Hard outcomes (timeout, reflection, replay-like texture) are permanent for
//! the session: reflection and replay are recorded as sticky flags, timeout
//! follows from the session's creation time.

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::fmt;
use std::time::Duration;

use crate::gesture::{GestureReading, GestureThresholds};
use crate::session::{Challenge, SessionState};
use crate::spoof::{ReflectionGuard, TextureDynamicsGuard, TimeoutGuard};
use crate::types::{FrameSize, GestureSample, Landmarks};

/// Default protocol time budget.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(20);

/// Why a session can no longer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Reflection,
    ReplayLike,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "liveness check timed out, please start again"),
            FailureReason::Reflection => write!(
                f,
                "screen reflection or replayed video detected, please use a real face"
            ),
            FailureReason::ReplayLike => write!(
                f,
                "frame dynamics look like a replayed video or photo, please use a real face"
            ),
        }
    }
}

/// Protocol position of a session at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    InProgress(usize),
    Completed,
    Failed(FailureReason),
}

/// Outcome of the guard phase for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screening {
    /// Guards passed; run the detector and call [`ChallengeMachine::advance`].
    Proceed,
    /// Session already finished; answer with the completed result again.
    Completed,
    Failed(FailureReason),
}

/// What the landmark detector saw in a frame.
#[derive(Debug, Clone)]
pub enum FaceObservation {
    Single(GestureSample),
    NoFace,
    MultipleFaces(usize),
    /// The detector failed or did not answer in time.
    Unavailable,
}

impl FaceObservation {
    pub fn from_faces(
        mut faces: Vec<Landmarks>,
        frame: FrameSize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        match faces.len() {
            0 => FaceObservation::NoFace,
            1 => match faces.pop() {
                Some(landmarks) => FaceObservation::Single(GestureSample {
                    landmarks,
                    frame,
                    timestamp,
                }),
                None => FaceObservation::NoFace,
            },
            n => FaceObservation::MultipleFaces(n),
        }
    }
}

/// In-band explanation attached to a frame that was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    NoFace,
    MultipleFaces,
    DetectorUnavailable,
    /// First frame of a head-motion step; stored as the comparison baseline.
    Baseline,
    Waiting,
    StepPassed(Challenge),
    AllPassed,
}

impl Notice {
    pub fn message(self) -> String {
        match self {
            Notice::NoFace | Notice::MultipleFaces => {
                "no single face detected, please face the camera alone".to_string()
            }
            Notice::DetectorUnavailable => {
                "face landmarks unavailable for this frame, please hold still".to_string()
            }
            Notice::Baseline | Notice::Waiting => String::new(),
            Notice::StepPassed(challenge) => format!("{} passed", challenge.name()),
            Notice::AllPassed => "all steps passed".to_string(),
        }
    }
}

/// Result of [`ChallengeMachine::advance`] for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Challenge the frame was evaluated against.
    pub challenge: Option<Challenge>,
    pub reading: GestureReading,
    /// Whether this frame completed its step.
    pub advanced: bool,
    pub notice: Notice,
}

/// Consecutive triggering frames each challenge needs before it passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredDetections {
    pub blink: u32,
    pub mouth_open: u32,
    pub nod: u32,
    pub shake: u32,
}

impl Default for RequiredDetections {
    fn default() -> Self {
        Self {
            blink: 2,
            mouth_open: 3,
            nod: 5,
            shake: 5,
        }
    }
}

impl RequiredDetections {
    pub fn for_challenge(&self, challenge: Challenge) -> u32 {
        match challenge {
            Challenge::Blink => self.blink,
            Challenge::MouthOpen => self.mouth_open,
            Challenge::Nod => self.nod,
            Challenge::Shake => self.shake,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    pub thresholds: GestureThresholds,
    pub required: RequiredDetections,
    pub protocol_timeout: Duration,
    pub reflection: ReflectionGuard,
    /// `None` disables the texture-dynamics guard.
    pub texture: Option<TextureDynamicsGuard>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            thresholds: GestureThresholds::default(),
            required: RequiredDetections::default(),
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            reflection: ReflectionGuard::default(),
            texture: None,
        }
    }
}

/// Stateless driver for [`SessionState`]; one instance serves all sessions.
#[derive(Debug, Clone)]
pub struct ChallengeMachine {
    config: MachineConfig,
    timeout: TimeoutGuard,
}

impl ChallengeMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            timeout: TimeoutGuard::new(config.protocol_timeout),
            config,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Current position of `state`, without consuming a frame.
    ///
    /// Completion and sticky spoof flags take precedence over the clock, so a
    /// decided session keeps answering the same way after its time budget.
    pub fn status(&self, state: &SessionState, now: DateTime<Utc>) -> SessionStatus {
        if state.is_complete() {
            SessionStatus::Completed
        } else if state.reflection_flag() {
            SessionStatus::Failed(FailureReason::Reflection)
        } else if state.replay_flag() {
            SessionStatus::Failed(FailureReason::ReplayLike)
        } else if self.timeout.expired(state.created_at(), now) {
            SessionStatus::Failed(FailureReason::Timeout)
        } else {
            SessionStatus::InProgress(state.current_index())
        }
    }

    /// Guard phase: terminal replay, timeout, reflection, texture dynamics.
    pub fn screen(
        &self,
        state: &mut SessionState,
        frame: &RgbImage,
        now: DateTime<Utc>,
    ) -> Screening {
        match self.status(state, now) {
            SessionStatus::Completed => return Screening::Completed,
            SessionStatus::Failed(reason) => return Screening::Failed(reason),
            SessionStatus::InProgress(_) => {}
        }

        if self.config.reflection.inspect(frame).detected {
            state.mark_reflection();
            return Screening::Failed(FailureReason::Reflection);
        }

        if let Some(texture) = &self.config.texture {
            if texture.observe(state.texture_mut(), frame).replay_like {
                state.mark_replay();
                return Screening::Failed(FailureReason::ReplayLike);
            }
        }

        Screening::Proceed
    }

    /// Gesture phase: evaluate the current step against the detector output.
    pub fn advance(&self, state: &mut SessionState, observation: FaceObservation) -> StepReport {
        let Some(challenge) = state.current_challenge() else {
            return StepReport {
                challenge: None,
                reading: GestureReading::IDLE,
                advanced: false,
                notice: Notice::AllPassed,
            };
        };
        let soft = |notice| StepReport {
            challenge: Some(challenge),
            reading: GestureReading::IDLE,
            advanced: false,
            notice,
        };

        let sample = match observation {
            FaceObservation::Single(sample) => sample,
            FaceObservation::NoFace => return soft(Notice::NoFace),
            FaceObservation::MultipleFaces(_) => return soft(Notice::MultipleFaces),
            FaceObservation::Unavailable => return soft(Notice::DetectorUnavailable),
        };

        let thresholds = &self.config.thresholds;
        let reading = match challenge {
            Challenge::Blink => thresholds.blink(&sample.landmarks),
            Challenge::MouthOpen => thresholds.mouth_open(&sample.landmarks),
            Challenge::Nod | Challenge::Shake => {
                let Some(current) = sample.landmarks.nose_center() else {
                    return soft(Notice::Waiting);
                };
                // Rolling baseline: always compare against the previous frame
                let Some(prior) = state.replace_reference(current) else {
                    return soft(Notice::Baseline);
                };
                if challenge == Challenge::Nod {
                    thresholds.nod(sample.frame, prior, current)
                } else {
                    thresholds.shake(sample.frame, prior, current)
                }
            }
        };

        let required = self.config.required.for_challenge(challenge);
        let advanced = reading.triggered && state.record_trigger(required);
        let notice = if !advanced {
            Notice::Waiting
        } else if state.is_complete() {
            Notice::AllPassed
        } else {
            Notice::StepPassed(challenge)
        };

        StepReport {
            challenge: Some(challenge),
            reading,
            advanced,
            notice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, LANDMARK_COUNT};
    use image::Rgb;

    const FRAME: FrameSize = FrameSize {
        width: 640,
        height: 480,
    };

    fn face(eye_half_height: f32, lip_gap: f32, nose: Point) -> Landmarks {
        let mut points = vec![Point::default(); LANDMARK_COUNT];
        for base in [36usize, 42] {
            let x = if base == 36 { 250.0 } else { 350.0 };
            let eye = [
                (0.0, 0.0),
                (10.0, -eye_half_height),
                (20.0, -eye_half_height),
                (30.0, 0.0),
                (20.0, eye_half_height),
                (10.0, eye_half_height),
            ];
            for (i, (dx, dy)) in eye.into_iter().enumerate() {
                points[base + i] = Point::new(x + dx, 200.0 + dy);
            }
        }
        for i in 32..36 {
            points[i] = nose;
        }
        points[48] = Point::new(290.0, 320.0);
        points[54] = Point::new(350.0, 320.0);
        points[50] = Point::new(310.0, 320.0 - lip_gap);
        points[57] = Point::new(310.0, 320.0 + lip_gap);
        points[52] = Point::new(330.0, 320.0 - lip_gap);
        points[55] = Point::new(330.0, 320.0 + lip_gap);
        Landmarks::new(points)
    }

    fn single(landmarks: Landmarks) -> FaceObservation {
        FaceObservation::Single(GestureSample {
            landmarks,
            frame: FRAME,
            timestamp: Utc::now(),
        })
    }

    fn neutral() -> FaceObservation {
        single(face(6.0, 2.0, Point::new(320.0, 260.0)))
    }

    fn blink() -> FaceObservation {
        single(face(1.0, 2.0, Point::new(320.0, 260.0)))
    }

    fn session(steps: Vec<Challenge>) -> SessionState {
        SessionState::new("test", steps, vec![0xff, 0xd8], Utc::now())
    }

    fn plain_frame() -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([120, 90, 80]))
    }

    #[test]
    fn test_required_triggers_advance_exactly_one_step() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink, Challenge::MouthOpen]);

        let first = machine.advance(&mut s, blink());
        assert!(first.reading.triggered);
        assert!(!first.advanced);
        assert_eq!(s.debounce(), 1);

        let second = machine.advance(&mut s, blink());
        assert!(second.advanced);
        assert_eq!(second.notice, Notice::StepPassed(Challenge::Blink));
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.debounce(), 0);
        assert_eq!(s.done_flags(), &[true, false]);
    }

    #[test]
    fn test_non_triggering_frame_keeps_count() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink]);
        machine.advance(&mut s, blink());
        let report = machine.advance(&mut s, neutral());
        assert!(!report.reading.triggered);
        assert_eq!(report.notice, Notice::Waiting);
        assert_eq!(s.debounce(), 1);
    }

    #[test]
    fn test_face_anomalies_are_soft() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Nod]);
        machine.advance(&mut s, neutral());
        let before = s.clone();

        for obs in [
            FaceObservation::NoFace,
            FaceObservation::MultipleFaces(2),
            FaceObservation::Unavailable,
        ] {
            let report = machine.advance(&mut s, obs);
            assert!(!report.advanced);
            assert_ne!(report.notice.message(), "");
        }
        assert_eq!(s, before);
    }

    #[test]
    fn test_from_faces_counts() {
        let now = Utc::now();
        assert!(matches!(
            FaceObservation::from_faces(vec![], FRAME, now),
            FaceObservation::NoFace
        ));
        assert!(matches!(
            FaceObservation::from_faces(vec![Landmarks::default(); 2], FRAME, now),
            FaceObservation::MultipleFaces(2)
        ));
        assert!(matches!(
            FaceObservation::from_faces(vec![Landmarks::default()], FRAME, now),
            FaceObservation::Single(_)
        ));
    }

    #[test]
    fn test_head_motion_first_frame_is_baseline() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Shake]);
        let report = machine.advance(&mut s, single(face(6.0, 2.0, Point::new(300.0, 260.0))));
        assert_eq!(report.notice, Notice::Baseline);
        assert_eq!(s.debounce(), 0);
        assert_eq!(s.reference(), Some(Point::new(300.0, 260.0)));
    }

    #[test]
    fn test_reference_rolls_even_without_trigger() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Nod]);
        machine.advance(&mut s, single(face(6.0, 2.0, Point::new(320.0, 260.0))));
        // 2 px is below the nod threshold (7.2 px at 480 high)
        let report = machine.advance(&mut s, single(face(6.0, 2.0, Point::new(320.0, 262.0))));
        assert!(!report.reading.triggered);
        assert_eq!(s.reference(), Some(Point::new(320.0, 262.0)));
        // Measured against 262, not the step's first frame
        let report = machine.advance(&mut s, single(face(6.0, 2.0, Point::new(320.0, 270.0))));
        assert!(report.reading.triggered);
        assert!((report.reading.ratio - 8.0 / 240.0).abs() < 1e-6);
    }

    #[test]
    fn test_timeout_hard_fails() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink]);
        machine.advance(&mut s, blink());
        let later = s.created_at() + chrono::Duration::seconds(21);
        assert_eq!(
            machine.screen(&mut s, &plain_frame(), later),
            Screening::Failed(FailureReason::Timeout)
        );
        assert_eq!(machine.status(&s, later), SessionStatus::Failed(FailureReason::Timeout));
        assert!(!s.is_complete());
    }

    #[test]
    fn test_reflection_is_sticky() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink]);
        let glare = RgbImage::from_pixel(64, 48, Rgb([250, 250, 250]));
        let now = s.created_at();
        assert_eq!(
            machine.screen(&mut s, &glare, now),
            Screening::Failed(FailureReason::Reflection)
        );
        assert!(s.reflection_flag());
        assert_eq!(
            machine.screen(&mut s, &plain_frame(), now),
            Screening::Failed(FailureReason::Reflection)
        );
        // Still reflection, not timeout, after the budget elapses
        let later = now + chrono::Duration::seconds(60);
        assert_eq!(
            machine.screen(&mut s, &plain_frame(), later),
            Screening::Failed(FailureReason::Reflection)
        );
    }

    #[test]
    fn test_completed_session_replays_completion() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink]);
        machine.advance(&mut s, blink());
        let report = machine.advance(&mut s, blink());
        assert_eq!(report.notice, Notice::AllPassed);
        let later = s.created_at() + chrono::Duration::seconds(120);
        assert_eq!(machine.screen(&mut s, &plain_frame(), later), Screening::Completed);
        let report = machine.advance(&mut s, blink());
        assert_eq!(report.challenge, None);
        assert_eq!(s.current_index(), 1);
    }

    #[test]
    fn test_texture_guard_flags_static_frames() {
        let machine = ChallengeMachine::new(MachineConfig {
            texture: Some(TextureDynamicsGuard::default()),
            ..MachineConfig::default()
        });
        let mut s = session(vec![Challenge::Blink]);
        let now = s.created_at();
        let mut outcome = Screening::Proceed;
        for _ in 0..6 {
            outcome = machine.screen(&mut s, &plain_frame(), now);
        }
        assert_eq!(outcome, Screening::Failed(FailureReason::ReplayLike));
        assert!(s.replay_flag());
        assert_eq!(machine.status(&s, now), SessionStatus::Failed(FailureReason::ReplayLike));
    }

    #[test]
    fn test_texture_guard_disabled_by_default() {
        let machine = ChallengeMachine::new(MachineConfig::default());
        let mut s = session(vec![Challenge::Blink]);
        let now = s.created_at();
        for _ in 0..10 {
            assert_eq!(machine.screen(&mut s, &plain_frame(), now), Screening::Proceed);
        }
        assert!(s.texture().is_empty());
    }
}
