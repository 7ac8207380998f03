use crate::pipeline::PipelineSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use vigil_core::{CapturePolicy, StoragePolicy};

const DEFAULT_STORAGE_BUDGET: u64 = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `VIGIL_*` environment variables. Built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root of the capture and gallery directories.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames buffered between the camera thread and the pipeline.
    pub queue_capacity: usize,
    /// L2 distance under which a face matches an identity.
    pub match_threshold: f32,
    /// Scale applied to frames before detection.
    pub downscale_factor: f64,
    pub capture_cooldown_secs: u64,
    /// 0 means unlimited.
    pub max_captures_per_session: u32,
    pub storage_budget_bytes: u64,
    /// 0 disables age-based deletion.
    pub retention_days: u32,
    /// L2 distance for grouping unknown faces into visitors; 0 or less
    /// shares one cooldown between all unknown faces.
    pub unknown_track_threshold: f32,
    /// Also keep rate-limited captures of recognised faces.
    pub capture_known: bool,
    pub history_capacity: usize,
}

/// Override file contents. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    camera_device: Option<String>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
    queue_capacity: Option<usize>,
    match_threshold: Option<f32>,
    downscale_factor: Option<f64>,
    capture_cooldown_secs: Option<u64>,
    max_captures_per_session: Option<u32>,
    storage_budget_bytes: Option<u64>,
    retention_days: Option<u32>,
    unknown_track_threshold: Option<f32>,
    capture_known: Option<bool>,
    history_capacity: Option<usize>,
}

impl Config {
    /// Load from the process environment and the default config file location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `env` to look up environment variables.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match config_file_path(&env) {
            Some(path) => read_file(&path)?,
            None => FileConfig::default(),
        };

        let data_dir = match env("VIGIL_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => file.data_dir.clone().unwrap_or_else(|| default_data_dir(&env)),
        };
        let model_dir = match env("VIGIL_MODEL_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => file.model_dir.clone().unwrap_or_else(|| data_dir.join("models")),
        };

        let config = Self {
            data_dir,
            model_dir,
            camera_device: env("VIGIL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: env_parse(&env, "VIGIL_FRAME_WIDTH", file.frame_width, 640)?,
            frame_height: env_parse(&env, "VIGIL_FRAME_HEIGHT", file.frame_height, 480)?,
            queue_capacity: env_parse(&env, "VIGIL_QUEUE_CAPACITY", file.queue_capacity, 10)?,
            match_threshold: env_parse(&env, "VIGIL_MATCH_THRESHOLD", file.match_threshold, 0.6)?,
            downscale_factor: env_parse(&env, "VIGIL_DOWNSCALE_FACTOR", file.downscale_factor, 0.25)?,
            capture_cooldown_secs: env_parse(
                &env,
                "VIGIL_CAPTURE_COOLDOWN_SECS",
                file.capture_cooldown_secs,
                5,
            )?,
            max_captures_per_session: env_parse(
                &env,
                "VIGIL_MAX_CAPTURES_PER_SESSION",
                file.max_captures_per_session,
                3,
            )?,
            storage_budget_bytes: env_parse(
                &env,
                "VIGIL_STORAGE_BUDGET_BYTES",
                file.storage_budget_bytes,
                DEFAULT_STORAGE_BUDGET,
            )?,
            retention_days: env_parse(&env, "VIGIL_RETENTION_DAYS", file.retention_days, 7)?,
            unknown_track_threshold: env_parse(
                &env,
                "VIGIL_UNKNOWN_TRACK_THRESHOLD",
                file.unknown_track_threshold,
                0.6,
            )?,
            capture_known: env_bool(&env, "VIGIL_CAPTURE_KNOWN", file.capture_known, false)?,
            history_capacity: env_parse(&env, "VIGIL_HISTORY_CAPACITY", file.history_capacity, 100)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.match_threshold.is_nan() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be positive, got {}",
                self.match_threshold
            )));
        }
        if self.downscale_factor.is_nan() || self.downscale_factor <= 0.0 || self.downscale_factor > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "downscale_factor must be in (0, 1], got {}",
                self.downscale_factor
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".into()));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid("frame size must be non-zero".into()));
        }
        Ok(())
    }

    /// Reference images of enrolled identities.
    pub fn known_faces_dir(&self) -> PathBuf {
        self.data_dir.join("known_faces")
    }

    pub fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy::new(self.storage_budget_bytes, self.retention_days)
    }

    pub fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy {
            cooldown: Duration::from_secs(self.capture_cooldown_secs),
            max_per_session: (self.max_captures_per_session > 0).then_some(self.max_captures_per_session),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            match_threshold: self.match_threshold,
            downscale_factor: self.downscale_factor,
            unknown_track_threshold: (self.unknown_track_threshold > 0.0)
                .then_some(self.unknown_track_threshold),
            capture_known: self.capture_known,
        }
    }
}

fn config_file_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = env("VIGIL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    let path = base.join("vigil").join("config.toml");
    path.exists().then_some(path)
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file");
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    tracing::info!(path = %path.display(), "loading config file");
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

fn env_parse<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file: Option<T>,
    default: T,
) -> Result<T, ConfigError> {
    match env(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
        None => Ok(file.unwrap_or(default)),
    }
}

fn env_bool(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file: Option<bool>,
    default: bool,
) -> Result<bool, ConfigError> {
    match env(key) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        },
        None => Ok(file.unwrap_or(default)),
    }
}
