use std::path::PathBuf;
use std::time::Duration;

use facecheck_core::gesture::{
    DEFAULT_EAR_THRESHOLD, DEFAULT_MAR_THRESHOLD, DEFAULT_NOD_THRESHOLD, DEFAULT_SHAKE_THRESHOLD,
};
use facecheck_core::spoof::DEFAULT_REFLECTION_THRESHOLD;
use facecheck_core::{
    GestureThresholds, MachineConfig, ReflectionGuard, RequiredDetections, TextureDynamicsGuard,
};

/// Which session store backs the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    /// Process-local map; sessions do not survive a restart.
    Memory,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub store: StoreKind,
    /// Path to the SQLite session database.
    pub db_path: PathBuf,
    /// Idle lifetime of a stored session; refreshed on every saved frame.
    pub session_ttl_secs: u64,
    /// Time budget for completing all challenges, counted from the first frame.
    pub protocol_timeout_secs: u64,
    /// Endpoint of the external landmark detector.
    pub detector_url: String,
    /// Bounded wait for one detector call before the frame is soft-failed.
    pub detector_timeout_ms: u64,
    /// Whether the frame-to-frame texture dynamics guard is enabled.
    pub texture_guard_enabled: bool,
    pub ear_threshold: f32,
    pub mar_threshold: f32,
    pub nod_threshold: f32,
    pub shake_threshold: f32,
    /// Brightness margin below 255 for the reflection heuristic.
    pub reflection_threshold: u8,
    /// Interval between sweeps that delete expired SQLite sessions.
    pub purge_interval_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `FACECHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facecheck");

        let db_path = std::env::var("FACECHECK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("sessions.db"));

        let store = match std::env::var("FACECHECK_STORE").as_deref() {
            Ok("memory") => StoreKind::Memory,
            _ => StoreKind::Sqlite,
        };

        Self {
            store,
            db_path,
            session_ttl_secs: env_u64("FACECHECK_SESSION_TTL_SECS", 600),
            protocol_timeout_secs: env_u64("FACECHECK_PROTOCOL_TIMEOUT_SECS", 20),
            detector_url: std::env::var("FACECHECK_DETECTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8091/landmarks".to_string()),
            detector_timeout_ms: env_u64("FACECHECK_DETECTOR_TIMEOUT_MS", 2000),
            texture_guard_enabled: std::env::var("FACECHECK_TEXTURE_GUARD")
                .map(|v| v == "1")
                .unwrap_or(false),
            ear_threshold: env_f32("FACECHECK_EAR_THRESHOLD", DEFAULT_EAR_THRESHOLD),
            mar_threshold: env_f32("FACECHECK_MAR_THRESHOLD", DEFAULT_MAR_THRESHOLD),
            nod_threshold: env_f32("FACECHECK_NOD_THRESHOLD", DEFAULT_NOD_THRESHOLD),
            shake_threshold: env_f32("FACECHECK_SHAKE_THRESHOLD", DEFAULT_SHAKE_THRESHOLD),
            reflection_threshold: env_u8(
                "FACECHECK_REFLECTION_THRESHOLD",
                DEFAULT_REFLECTION_THRESHOLD,
            ),
            purge_interval_secs: env_u64("FACECHECK_PURGE_INTERVAL_SECS", 60),
            session_bus: std::env::var("FACECHECK_SESSION_BUS").is_ok(),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    /// Protocol settings for the challenge state machine.
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            thresholds: GestureThresholds {
                ear: self.ear_threshold,
                mar: self.mar_threshold,
                nod: self.nod_threshold,
                shake: self.shake_threshold,
            },
            required: RequiredDetections::default(),
            protocol_timeout: Duration::from_secs(self.protocol_timeout_secs),
            reflection: ReflectionGuard::new(self.reflection_threshold),
            texture: self
                .texture_guard_enabled
                .then(TextureDynamicsGuard::default),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
