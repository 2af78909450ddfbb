use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transcoding: TranscodingConfig,
    pub cleanup: CleanupConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    /// Base directory for `content/` and `sessions/` trees
    pub root: PathBuf,
    /// Cap on concurrently running sessions
    pub max_concurrent: usize,
    /// Admission headroom beyond `max_concurrent`; over the sum, new
    /// sessions are rejected instead of silently queued
    pub queue_size: usize,
    /// Per-session hard timeout in seconds
    pub session_timeout_seconds: u64,
    /// Default for the planner's hardware preference
    pub prefer_hardware: bool,
    /// Accelerator type requested when `prefer_hardware` is set
    /// (e.g. "vaapi", "nvenc", "videotoolbox")
    pub hardware_type: String,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/viewra/transcode"),
            max_concurrent: 4,
            queue_size: 8,
            session_timeout_seconds: 2 * 60 * 60,
            prefer_hardware: false,
            hardware_type: String::new(),
        }
    }
}

impl TranscodingConfig {
    #[must_use]
    pub fn content_root(&self) -> PathBuf {
        self.root.join("content")
    }

    #[must_use]
    pub fn sessions_root(&self) -> PathBuf {
        self.root.join("sessions")
    }

    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Seconds between cleanup cycles
    pub interval_seconds: u64,
    /// Retention for completed sessions, seconds
    pub retention_completed_seconds: u64,
    /// Retention for failed and cancelled sessions, seconds
    pub retention_failed_seconds: u64,
    /// Hard quota on the content tree; exceeding it triggers emergency
    /// cleanup down to 90% of this value
    pub max_total_size_gb: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 3600,
            retention_completed_seconds: 24 * 60 * 60,
            retention_failed_seconds: 6 * 60 * 60,
            max_total_size_gb: 100,
        }
    }
}

impl CleanupConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    #[must_use]
    pub const fn retention_completed(&self) -> Duration {
        Duration::from_secs(self.retention_completed_seconds)
    }

    #[must_use]
    pub const fn retention_failed(&self) -> Duration {
        Duration::from_secs(self.retention_failed_seconds)
    }

    #[must_use]
    pub const fn max_total_size_bytes(&self) -> u64 {
        self.max_total_size_gb * 1024 * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL; empty derives `sqlite:{root}/viewra.db`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, "pretty" for development
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Packager binary (shaka-packager) for adaptive output
    pub packager_path: String,
    /// Segment duration for adaptive output, seconds. Also pins the
    /// keyframe interval so fingerprint-equal runs produce identical GOPs.
    pub segment_duration_seconds: u32,
    /// Grace period between the quit request and SIGKILL
    pub stop_grace_seconds: u64,
    /// Hardware accelerators to register providers for
    /// (e.g. ["vaapi"]); empty registers software only
    pub hardware_accelerators: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            packager_path: "packager".to_string(),
            segment_duration_seconds: 4,
            stop_grace_seconds: 5,
            hardware_accelerators: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from file (optional) and environment
    ///
    /// Layering, later wins: defaults → config file → `VIEWRA__*` env vars →
    /// the documented `TRANSCODE_*` knobs.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("config/viewra").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("VIEWRA")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment knobs on top of file configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("TRANSCODE_ROOT") {
            if !root.is_empty() {
                self.transcoding.root = PathBuf::from(root);
            }
        }
        if let Some(n) = env_parse::<usize>("TRANSCODE_MAX_CONCURRENT") {
            self.transcoding.max_concurrent = n;
        }
        if let Some(n) = env_parse::<usize>("TRANSCODE_QUEUE_SIZE") {
            self.transcoding.queue_size = n;
        }
        if let Some(d) = env_duration("TRANSCODE_SESSION_TIMEOUT") {
            self.transcoding.session_timeout_seconds = d.as_secs();
        }
        if let Some(d) = env_duration("TRANSCODE_RETENTION_COMPLETED") {
            self.cleanup.retention_completed_seconds = d.as_secs();
        }
        if let Some(d) = env_duration("TRANSCODE_RETENTION_FAILED") {
            self.cleanup.retention_failed_seconds = d.as_secs();
        }
        if let Some(n) = env_parse::<u64>("TRANSCODE_MAX_TOTAL_SIZE_GB") {
            self.cleanup.max_total_size_gb = n;
        }
        if let Some(d) = env_duration("TRANSCODE_CLEANUP_INTERVAL") {
            self.cleanup.interval_seconds = d.as_secs();
        }
        if let Some(b) = env_parse::<bool>("PREFER_HARDWARE") {
            self.transcoding.prefer_hardware = b;
        }
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transcoding.root.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "transcoding.root must not be empty".to_string(),
            ));
        }
        if self.transcoding.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "transcoding.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.transcoding.session_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "transcoding.session_timeout must be positive".to_string(),
            ));
        }
        if self.cleanup.max_total_size_gb == 0 {
            return Err(ConfigError::Message(
                "cleanup.max_total_size_gb must be positive".to_string(),
            ));
        }
        if self.encoder.segment_duration_seconds == 0 {
            return Err(ConfigError::Message(
                "encoder.segment_duration must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved SQLite URL; `mode=rwc` creates the file on first start
    #[must_use]
    pub fn database_url(&self) -> String {
        if self.database.url.is_empty() {
            format!("sqlite:{}/viewra.db?mode=rwc", self.transcoding.root.display())
        } else {
            self.database.url.clone()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Parse a duration knob, accepting humantime ("2h", "30m") or plain seconds
fn env_duration(key: &str) -> Option<Duration> {
    let value = std::env::var(key).ok()?;
    humantime::parse_duration(&value)
        .ok()
        .or_else(|| value.parse::<u64>().ok().map(Duration::from_secs))
}
