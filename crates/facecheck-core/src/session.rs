use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::spoof::TextureHistory;
use crate::types::Point;

/// A physical gesture the subject is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Blink,
    #[serde(rename = "mouth")]
    MouthOpen,
    Nod,
    Shake,
}

impl Challenge {
    pub const ALL: [Challenge; 4] = [
        Challenge::Blink,
        Challenge::MouthOpen,
        Challenge::Nod,
        Challenge::Shake,
    ];

    /// Stable machine name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Challenge::Blink => "blink",
            Challenge::MouthOpen => "mouth",
            Challenge::Nod => "nod",
            Challenge::Shake => "shake",
        }
    }

    /// Instruction shown to the subject.
    pub fn prompt(self) -> &'static str {
        match self {
            Challenge::Blink => "Please blink",
            Challenge::MouthOpen => "Please open your mouth",
            Challenge::Nod => "Please nod your head",
            Challenge::Shake => "Please shake your head",
        }
    }

    /// Nod and shake compare the nose position against the previous frame.
    pub fn is_head_motion(self) -> bool {
        matches!(self, Challenge::Nod | Challenge::Shake)
    }
}

/// Protocol state for one liveness session.
///
/// The state is owned by an external store and moved through an explicit
/// load → mutate → save cycle on every frame. Step bookkeeping maintains
/// `done[i] == (i < current_index)`; the debounce counter and head-motion
/// reference are cleared together whenever a step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    id: String,
    steps: Vec<Challenge>,
    current_index: usize,
    done: Vec<bool>,
    debounce: u32,
    reference: Option<Point>,
    reflection_flag: bool,
    #[serde(default)]
    replay_flag: bool,
    #[serde(with = "base64_bytes")]
    first_frame: Vec<u8>,
    #[serde(default)]
    texture: TextureHistory,
    created_at: DateTime<Utc>,
}

impl SessionState {
    /// Create a session with a fixed step order.
    pub fn new(
        id: impl Into<String>,
        steps: Vec<Challenge>,
        first_frame: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let done = vec![false; steps.len()];
        Self {
            id: id.into(),
            steps,
            current_index: 0,
            done,
            debounce: 0,
            reference: None,
            reflection_flag: false,
            replay_flag: false,
            first_frame,
            texture: TextureHistory::default(),
            created_at,
        }
    }

    /// Create a session whose step order is a uniform shuffle of all challenges.
    pub fn with_random_order<R: Rng + ?Sized>(
        id: impl Into<String>,
        first_frame: Vec<u8>,
        created_at: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        let mut steps = Challenge::ALL.to_vec();
        steps.shuffle(rng);
        Self::new(id, steps, first_frame, created_at)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[Challenge] {
        &self.steps
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn done_flags(&self) -> &[bool] {
        &self.done
    }

    pub fn debounce(&self) -> u32 {
        self.debounce
    }

    pub fn reference(&self) -> Option<Point> {
        self.reference
    }

    pub fn reflection_flag(&self) -> bool {
        self.reflection_flag
    }

    pub fn replay_flag(&self) -> bool {
        self.replay_flag
    }

    pub fn first_frame(&self) -> &[u8] {
        &self.first_frame
    }

    pub fn texture(&self) -> &TextureHistory {
        &self.texture
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Challenge awaiting completion, or `None` once every step is done.
    pub fn current_challenge(&self) -> Option<Challenge> {
        self.steps.get(self.current_index).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.steps.len()
    }

    pub(crate) fn texture_mut(&mut self) -> &mut TextureHistory {
        &mut self.texture
    }

    pub(crate) fn mark_reflection(&mut self) {
        self.reflection_flag = true;
    }

    pub(crate) fn mark_replay(&mut self) {
        self.replay_flag = true;
    }

    /// Store `current` as the head-motion baseline, returning the previous one.
    pub(crate) fn replace_reference(&mut self, current: Point) -> Option<Point> {
        self.reference.replace(current)
    }

    /// Count one triggering frame; completes the step once `required` is reached.
    /// Returns whether the step advanced.
    pub(crate) fn record_trigger(&mut self, required: u32) -> bool {
        self.debounce = self.debounce.saturating_add(1);
        if self.debounce < required.max(1) {
            return false;
        }
        if let Some(flag) = self.done.get_mut(self.current_index) {
            *flag = true;
            self.current_index += 1;
        }
        self.debounce = 0;
        self.reference = None;
        true
    }
}
