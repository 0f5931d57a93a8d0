use anyhow::{Context, Result};
use rollcall_core::{PipelineConfig, ThrottleConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration.
///
/// Read from the TOML file named by `ROLLCALL_CONFIG` (if set), then
/// overridden field by field from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Tried when `camera_device` cannot be opened (default: /dev/video1).
    pub camera_fallback: Option<String>,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the face-match service.
    pub match_endpoint: String,
    /// Sent as a bearer token when set.
    pub match_api_key: Option<String>,
    /// Face collection searched on every match.
    pub collection_id: String,
    /// Minimum similarity (0–100) for a positive match.
    pub threshold: f32,
    pub max_faces: u32,
    pub min_interval_ms: u64,
    pub cooldown_secs: u64,
    /// Upper bound on remembered identities in the cooldown table.
    pub cooldown_capacity: Option<usize>,
    pub poll_interval_ms: u64,
    pub match_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub jpeg_quality: u8,
    /// Skip frames without a plausible face before calling the service.
    pub local_filter: bool,
    /// Start the pipeline as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_fallback: Some("/dev/video1".to_string()),
            camera_width: 640,
            camera_height: 480,
            db_path: rollcall_store::default_db_path(),
            match_endpoint: "http://127.0.0.1:8080".to_string(),
            match_api_key: None,
            collection_id: "classroom".to_string(),
            threshold: 85.0,
            max_faces: 5,
            min_interval_ms: 1000,
            cooldown_secs: 10,
            cooldown_capacity: None,
            poll_interval_ms: 50,
            match_timeout_ms: 5000,
            error_backoff_ms: 2000,
            jpeg_quality: 85,
            local_filter: true,
            autostart: false,
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_CONFIG` and `ROLLCALL_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_CAMERA_FALLBACK") {
            self.camera_fallback = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_MATCH_ENDPOINT") {
            self.match_endpoint = v;
        }
        if let Some(v) = var("ROLLCALL_MATCH_API_KEY") {
            self.match_api_key = Some(v);
        }
        if let Some(v) = var("ROLLCALL_COLLECTION_ID") {
            self.collection_id = v;
        }
        parse_into(&var, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        parse_into(&var, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        parse_into(&var, "ROLLCALL_THRESHOLD", &mut self.threshold);
        parse_into(&var, "ROLLCALL_MAX_FACES", &mut self.max_faces);
        parse_into(&var, "ROLLCALL_MIN_INTERVAL_MS", &mut self.min_interval_ms);
        parse_into(&var, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        parse_into(&var, "ROLLCALL_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(&var, "ROLLCALL_MATCH_TIMEOUT_MS", &mut self.match_timeout_ms);
        parse_into(&var, "ROLLCALL_ERROR_BACKOFF_MS", &mut self.error_backoff_ms);
        parse_into(&var, "ROLLCALL_JPEG_QUALITY", &mut self.jpeg_quality);
        if let Some(v) = var("ROLLCALL_LOCAL_FILTER") {
            self.local_filter = v != "0";
        }
        if let Some(v) = var("ROLLCALL_AUTOSTART") {
            self.autostart = v != "0";
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.threshold),
            "threshold must be within 0..=100, got {}",
            self.threshold
        );
        anyhow::ensure!(self.max_faces > 0, "max_faces must be at least 1");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        anyhow::ensure!(
            !self.collection_id.trim().is_empty(),
            "collection_id must not be empty"
        );
        Ok(())
    }

    /// Camera devices in the order they are tried.
    pub fn camera_devices(&self) -> Vec<String> {
        let mut devices = vec![self.camera_device.clone()];
        if let Some(fallback) = &self.camera_fallback {
            if fallback != &self.camera_device {
                devices.push(fallback.clone());
            }
        }
        devices
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            threshold: self.threshold,
            max_faces: self.max_faces,
            match_timeout: Duration::from_millis(self.match_timeout_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            jpeg_quality: self.jpeg_quality,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..PipelineConfig::default()
        }
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Overwrite `slot` if `key` is set and parses; a bad value is logged and ignored.
fn parse_into<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}
