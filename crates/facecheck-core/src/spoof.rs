//! Frame-level spoof heuristics that do not depend on landmarks.
//!
//! # Threat Coverage
//!
//! - **Reflection**: phone/tablet screens and glossy prints held up to the
//!   camera produce large saturated highlights. Two heuristics are OR-ed: a
//!   grayscale brightness fraction and an HSV "bright but colourless" fraction.
//! - **Texture dynamics** (optional): a looping video or static photo changes
//!   between frames with suspiciously regular magnitude, while a live face
//!   produces irregular micro-motion.
//! - **Timeout**: bounds the whole protocol so a recorded clip cannot be
//!   searched frame by frame for matching gestures.

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::encoding::base64_bytes_opt;

/// Default brightness margin: gray pixels above `255 - 30` count as bright.
pub const DEFAULT_REFLECTION_THRESHOLD: u8 = 30;
const BRIGHT_FRACTION_LIMIT: f32 = 0.18;
const GLARE_VALUE_FLOOR: u8 = 220;
const GLARE_SATURATION_CEILING: u8 = 40;
const GLARE_FRACTION_LIMIT: f32 = 0.10;

/// Side length of the grayscale grid used for texture comparison.
pub const TEXTURE_GRID: u32 = 64;
/// Maximum number of frame-difference samples kept per session.
pub const TEXTURE_HISTORY_LEN: usize = 30;
const TEXTURE_MIN_SAMPLES: usize = 5;
const TEXTURE_STD_FLOOR: f32 = 4.0;

/// Per-frame result of the reflection heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionReport {
    pub detected: bool,
    /// Fraction of grayscale pixels above the brightness cutoff.
    pub bright_fraction: f32,
    /// Fraction of pixels that are both bright and low-saturation.
    pub glare_fraction: f32,
}

/// Stateless screen/photo glare detector.
#[derive(Debug, Clone, Copy)]
pub struct ReflectionGuard {
    threshold: u8,
}

impl Default for ReflectionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REFLECTION_THRESHOLD)
    }
}

impl ReflectionGuard {
    /// `threshold` is the brightness margin below 255; higher is stricter.
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn inspect(&self, frame: &RgbImage) -> ReflectionReport {
        let total = u64::from(frame.width()) * u64::from(frame.height());
        if total == 0 {
            return ReflectionReport {
                detected: false,
                bright_fraction: 0.0,
                glare_fraction: 0.0,
            };
        }

        let cutoff = 255 - self.threshold;
        let bright = imageops::grayscale(frame)
            .pixels()
            .filter(|p| p.0[0] > cutoff)
            .count() as u64;

        let glare = frame
            .pixels()
            .filter(|p| {
                let (saturation, value) = saturation_value(p.0);
                value > GLARE_VALUE_FLOOR && saturation < GLARE_SATURATION_CEILING
            })
            .count() as u64;

        let bright_fraction = bright as f32 / total as f32;
        let glare_fraction = glare as f32 / total as f32;
        ReflectionReport {
            detected: bright_fraction > BRIGHT_FRACTION_LIMIT
                || glare_fraction > GLARE_FRACTION_LIMIT,
            bright_fraction,
            glare_fraction,
        }
    }
}

/// HSV saturation and value of an RGB pixel, both scaled to 0-255.
fn saturation_value([r, g, b]: [u8; 3]) -> (u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max == 0 {
        return (0, 0);
    }
    let saturation = (u32::from(max - min) * 255 + u32::from(max) / 2) / u32::from(max);
    (saturation as u8, max)
}

/// Rolling frame-difference history kept inside the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextureHistory {
    #[serde(default, with = "base64_bytes_opt")]
    previous: Option<Vec<u8>>,
    #[serde(default)]
    diffs: VecDeque<f32>,
}

impl TextureHistory {
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.diffs.iter().copied()
    }
}

/// Result of feeding one frame to the texture dynamics guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureReport {
    pub replay_like: bool,
    /// Population standard deviation of the history, once enough samples exist.
    pub std_dev: Option<f32>,
    pub samples: usize,
}

/// Flags sessions whose frame-to-frame change is too regular to be a live face.
#[derive(Debug, Clone, Copy)]
pub struct TextureDynamicsGuard {
    capacity: usize,
    min_samples: usize,
    std_floor: f32,
}

impl Default for TextureDynamicsGuard {
    fn default() -> Self {
        Self {
            capacity: TEXTURE_HISTORY_LEN,
            min_samples: TEXTURE_MIN_SAMPLES,
            std_floor: TEXTURE_STD_FLOOR,
        }
    }
}

impl TextureDynamicsGuard {
    /// Downsample `frame`, append its difference from the previous frame to
    /// `history` (evicting the oldest sample at capacity) and judge the result.
    pub fn observe(&self, history: &mut TextureHistory, frame: &RgbImage) -> TextureReport {
        let gray = imageops::grayscale(frame);
        let small = imageops::resize(&gray, TEXTURE_GRID, TEXTURE_GRID, FilterType::Triangle)
            .into_raw();

        let Some(previous) = history.previous.replace(small) else {
            return TextureReport {
                replay_like: false,
                std_dev: None,
                samples: history.len(),
            };
        };
        let current = history.previous.as_deref().unwrap_or_default();
        let diff = mean_abs_diff(&previous, current);
        if history.diffs.len() >= self.capacity {
            history.diffs.pop_front();
        }
        history.diffs.push_back(diff);

        if history.len() < self.min_samples {
            return TextureReport {
                replay_like: false,
                std_dev: None,
                samples: history.len(),
            };
        }

        let std_dev = population_std_dev(&history.diffs);
        TextureReport {
            replay_like: std_dev < self.std_floor,
            std_dev: Some(std_dev),
            samples: history.len(),
        }
    }
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: u64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    sum as f32 / a.len() as f32
}

fn population_std_dev(samples: &VecDeque<f32>) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    let variance = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / n;
    variance.sqrt()
}

/// Rejects frames once the protocol time budget has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    budget: Duration,
}

impl TimeoutGuard {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let elapsed_ms = now.signed_duration_since(created_at).num_milliseconds();
        let budget_ms = i64::try_from(self.budget.as_millis()).unwrap_or(i64::MAX);
        elapsed_ms > budget_ms
    }
}
