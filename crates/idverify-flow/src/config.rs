use idverify_core::LoadSettings;
use idverify_media::DeviceConstraints;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Names the optional TOML file layered under the environment.
pub const CONFIG_PATH_VAR: &str = "IDVERIFY_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Flow configuration: defaults, then the TOML file, then `IDVERIFY_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the face comparison API.
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Similarity threshold sent with each comparison (0-100).
    pub similarity_threshold: f64,
    pub license_key: String,
    /// Recognition engine bundle.
    pub engine_location: String,
    /// Recognition worker script.
    pub worker_location: String,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after a camera opens (auto-exposure settling).
    pub warmup_frames: usize,
    /// Identical detection feedback within this window collapses to one update.
    pub feedback_debounce_ms: u64,
    /// Delay between live camera frames after a rejection.
    pub frame_interval_ms: u64,
    /// Consecutive unsuccessful attempts on one slot before the flow fails. 0 disables.
    pub rejection_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 10,
            similarity_threshold: 70.0,
            license_key: String::new(),
            engine_location: "/resources".to_string(),
            worker_location: "/resources/BlinkIDWasmSDK.worker.min.js".to_string(),
            camera_device: "/dev/video0".to_string(),
            camera_width: 1280,
            camera_height: 720,
            warmup_frames: 4,
            feedback_debounce_ms: 1000,
            frame_interval_ms: 200,
            rejection_limit: 50,
        }
    }
}

impl Config {
    /// Load from the process environment, reading `IDVERIFY_CONFIG` first if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(&lookup);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        env_string(lookup, "IDVERIFY_API_BASE_URL", &mut self.api_base_url);
        env_parse(lookup, "IDVERIFY_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        env_parse(lookup, "IDVERIFY_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_string(lookup, "IDVERIFY_LICENSE_KEY", &mut self.license_key);
        env_string(lookup, "IDVERIFY_ENGINE_LOCATION", &mut self.engine_location);
        env_string(lookup, "IDVERIFY_WORKER_LOCATION", &mut self.worker_location);
        env_string(lookup, "IDVERIFY_CAMERA_DEVICE", &mut self.camera_device);
        env_parse(lookup, "IDVERIFY_CAMERA_WIDTH", &mut self.camera_width);
        env_parse(lookup, "IDVERIFY_CAMERA_HEIGHT", &mut self.camera_height);
        env_parse(lookup, "IDVERIFY_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(lookup, "IDVERIFY_FEEDBACK_DEBOUNCE_MS", &mut self.feedback_debounce_ms);
        env_parse(lookup, "IDVERIFY_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env_parse(lookup, "IDVERIFY_REJECTION_LIMIT", &mut self.rejection_limit);
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn feedback_debounce(&self) -> Duration {
        Duration::from_millis(self.feedback_debounce_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            license_key: self.license_key.clone(),
            engine_location: self.engine_location.clone(),
            worker_location: self.worker_location.clone(),
        }
    }

    pub fn device_constraints(&self) -> DeviceConstraints {
        DeviceConstraints {
            device: self.camera_device.clone(),
            width: self.camera_width,
            height: self.camera_height,
            warmup_frames: self.warmup_frames,
        }
    }

    /// Copy safe to print: the license key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.license_key.is_empty() {
            config.license_key = "********".to_string();
        }
        config
    }
}

fn env_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut String) {
    if let Some(v) = lookup(key) {
        *slot = v;
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.similarity_threshold, 70.0);
        assert_eq!(config.device_constraints().warmup_frames, 4);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("IDVERIFY_API_BASE_URL", "https://faces.example"),
            ("IDVERIFY_SIMILARITY_THRESHOLD", "85.5"),
            ("IDVERIFY_REJECTION_LIMIT", "0"),
            ("IDVERIFY_LICENSE_KEY", "sRwAAAYJ"),
        ]))
        .unwrap();
        assert_eq!(config.api_base_url, "https://faces.example");
        assert_eq!(config.similarity_threshold, 85.5);
        assert_eq!(config.rejection_limit, 0);
        assert_eq!(config.load_settings().license_key, "sRwAAAYJ");
    }

    #[test]
    fn test_unparsable_value_keeps_default() {
        let config = Config::from_lookup(lookup(&[("IDVERIFY_FRAME_INTERVAL_MS", "soon")])).unwrap();
        assert_eq!(config.frame_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_file_then_env() {
        let path = std::env::temp_dir().join(format!("idverify-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "api_base_url = \"http://file:9000\"\ncamera_device = \"/dev/video2\"\n",
        )
        .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::from_lookup(lookup(&[
            (CONFIG_PATH_VAR, path_str.as_str()),
            ("IDVERIFY_CAMERA_DEVICE", "/dev/video4"),
        ]))
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.api_base_url, "http://file:9000");
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::from_lookup(lookup(&[(CONFIG_PATH_VAR, "/nonexistent/idverify.toml")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_redacted_masks_license() {
        let config = Config {
            license_key: "secret".into(),
            ..Config::default()
        };
        assert_eq!(config.redacted().license_key, "********");
        assert_eq!(Config::default().redacted().license_key, "");
    }
}
