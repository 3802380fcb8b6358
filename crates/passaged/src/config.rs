use std::path::PathBuf;

use passage_core::{EngineConfig, LivenessConfig};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file (user records, audit log).
    pub db_path: PathBuf,
    /// Path to the identity index snapshot file.
    pub index_path: PathBuf,
    /// Seconds after which an idle liveness session is discarded.
    pub session_idle_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    /// Caller-UID validation for admin methods is skipped on the session bus.
    pub session_bus: bool,
    /// Decision-engine thresholds, validated at engine construction.
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from `PASSAGE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("PASSAGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("passage")
            });

        let db_path = std::env::var("PASSAGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("passage.db"));
        let index_path = std::env::var("PASSAGE_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identity.idx"));

        let defaults = EngineConfig::default();
        let liveness_defaults = LivenessConfig::default();

        let engine = EngineConfig {
            detection_confidence: env_f32(
                "PASSAGE_DETECTION_CONFIDENCE",
                defaults.detection_confidence,
            ),
            detection_confidence_high: env_f32(
                "PASSAGE_DETECTION_CONFIDENCE_HIGH",
                defaults.detection_confidence_high,
            ),
            recognition_threshold: env_f32(
                "PASSAGE_RECOGNITION_THRESHOLD",
                defaults.recognition_threshold,
            ),
            recognition_threshold_strict: env_f32(
                "PASSAGE_RECOGNITION_THRESHOLD_STRICT",
                defaults.recognition_threshold_strict,
            ),
            recognition_threshold_relaxed: env_f32(
                "PASSAGE_RECOGNITION_THRESHOLD_RELAXED",
                defaults.recognition_threshold_relaxed,
            ),
            min_face_size: env_f32("PASSAGE_MIN_FACE_SIZE", defaults.min_face_size),
            max_face_size: env_f32("PASSAGE_MAX_FACE_SIZE", defaults.max_face_size),
            liveness: LivenessConfig {
                frames_required: env_usize(
                    "PASSAGE_LIVENESS_FRAMES",
                    liveness_defaults.frames_required,
                ),
                history_len: env_usize(
                    "PASSAGE_LIVENESS_HISTORY",
                    liveness_defaults.history_len,
                ),
                movement_threshold: env_f32(
                    "PASSAGE_MOVEMENT_THRESHOLD",
                    liveness_defaults.movement_threshold,
                ),
                texture_variance_threshold: env_f32(
                    "PASSAGE_TEXTURE_VARIANCE_THRESHOLD",
                    liveness_defaults.texture_variance_threshold,
                ),
                blink_detection: std::env::var("PASSAGE_BLINK_DETECTION")
                    .map(|v| v != "0")
                    .unwrap_or(liveness_defaults.blink_detection),
                ear_threshold: env_f32("PASSAGE_EAR_THRESHOLD", liveness_defaults.ear_threshold),
            },
        };

        Self {
            db_path,
            index_path,
            session_idle_secs: env_u64("PASSAGE_SESSION_IDLE_SECS", 30),
            session_bus: std::env::var("PASSAGE_SESSION_BUS").is_ok(),
            engine,
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

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
