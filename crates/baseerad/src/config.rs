use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
///
/// Tunables that operators change at runtime (thresholds, cooldowns, alert
/// templates) live in the settings table instead; see [`crate::settings`].
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Enrollment frames are written under `<known_faces_dir>/<name>/`.
    pub known_faces_dir: PathBuf,
    /// Snapshots of unrecognized visitors.
    pub unknown_dir: PathBuf,
    /// TTF/OTF font for overlay labels. Boxes are still drawn without one.
    pub overlay_font: Option<PathBuf>,
    /// Upper bound on waiting for the worker to finish its current iteration.
    pub stop_timeout: Duration,
    /// Sleep after a failed frame read before retrying.
    pub read_backoff: Duration,
    /// Number of frames captured per enrollment.
    pub frames_per_enroll: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `BASEERA_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("BASEERA_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| baseera_core::default_model_dir());

        let data_dir = std::env::var("BASEERA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let db_path = std::env::var("BASEERA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            camera_device: std::env::var("BASEERA_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            capture_width: env_u32("BASEERA_CAPTURE_WIDTH", 640),
            capture_height: env_u32("BASEERA_CAPTURE_HEIGHT", 480),
            model_dir,
            db_path,
            known_faces_dir: env_path("BASEERA_KNOWN_FACES_DIR")
                .unwrap_or_else(|| data_dir.join("known_faces")),
            unknown_dir: env_path("BASEERA_UNKNOWN_DIR")
                .unwrap_or_else(|| data_dir.join("unknown_visitors")),
            overlay_font: env_path("BASEERA_OVERLAY_FONT"),
            stop_timeout: Duration::from_millis(env_u64("BASEERA_STOP_TIMEOUT_MS", 1000)),
            read_backoff: Duration::from_millis(env_u64("BASEERA_READ_BACKOFF_MS", 100)),
            frames_per_enroll: env_u64("BASEERA_FRAMES_PER_ENROLL", 3).max(1) as usize,
            system_bus: std::env::var("BASEERA_BUS")
                .map(|v| v.eq_ignore_ascii_case("system"))
                .unwrap_or(false),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the 68-point landmark model.
    pub fn landmark_model_path(&self) -> String {
        self.model_path("landmarks_68.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("w600k_r50.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("baseera")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_u32(key: &str, default: u32) -> u32 {
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
