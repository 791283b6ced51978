use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::languages::normalize_code;

/// Environment variable selecting the model size/variant
pub const MODEL_ENV: &str = "WHISPER_MODEL";
/// Environment variable selecting the listening port
pub const PORT_ENV: &str = "PORT";
/// Environment variable pointing at an alternate config file
pub const CONFIG_PATH_ENV: &str = "WHISPER_SERVICE_CONFIG";

/// Service configuration, read once at process start
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,
    /// Model selection and loading
    pub model: ModelConfig,
    /// Per-request transcription settings
    pub transcription: TranscriptionConfig,
    /// Temporary upload storage
    pub uploads: UploadsConfig,
    /// Logging
    pub telemetry: TelemetryConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Largest accepted request body
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8765,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Execution device preference for the model
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Use the GPU backend when whisper.cpp was built with one
    #[default]
    Auto,
    /// Force CPU inference
    Cpu,
    /// Request GPU inference
    Gpu,
}

impl Device {
    /// Wire name reported by `/health`
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }

    /// Whether the whisper context should try the GPU backend
    #[must_use]
    pub const fn use_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// Numeric precision preference, mapped onto quantized ggml weights
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputeType {
    /// Full-precision weights as published
    #[default]
    Auto,
    /// 5-bit quantization, variant 0
    Q5_0,
    /// 5-bit quantization, variant 1
    Q5_1,
    /// 8-bit quantization
    Q8_0,
}

impl ComputeType {
    /// Filename suffix used by the whisper.cpp weight mirror
    #[must_use]
    pub const fn file_suffix(self) -> Option<&'static str> {
        match self {
            Self::Auto => None,
            Self::Q5_0 => Some("q5_0"),
            Self::Q5_1 => Some("q5_1"),
            Self::Q8_0 => Some("q8_0"),
        }
    }
}

/// Model selection and loading
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    /// Model size/variant (tiny, base, small, medium, large-v3, ...)
    pub name: String,
    /// Directory holding ggml weight files
    pub dir: String,
    /// Execution device preference
    pub device: Device,
    /// Numeric precision preference
    pub compute_type: ComputeType,
    /// CPU threads for inference
    pub threads: usize,
    /// Beam search width (1 = greedy)
    pub beam_size: usize,
    /// Load the model before accepting connections
    pub preload: bool,
    /// Fetch missing weights from the public mirror
    pub download: bool,
    /// Silero VAD weights; when set, non-speech is skipped before decoding
    pub vad_model: Option<String>,
    /// Silence that splits speech regions, in milliseconds
    pub vad_min_silence_ms: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "tiny".to_owned(),
            dir: "~/.whisper-service/models".to_owned(),
            device: Device::Auto,
            compute_type: ComputeType::Auto,
            threads: 4,
            beam_size: 5,
            preload: true,
            download: true,
            vad_model: None,
            vad_min_silence_ms: 500,
        }
    }
}

impl ModelConfig {
    /// Weight filename on disk and on the mirror, e.g. `ggml-base-q5_1.bin`
    #[must_use]
    pub fn file_name(&self) -> String {
        self.compute_type.file_suffix().map_or_else(
            || format!("ggml-{}.bin", self.name),
            |suffix| format!("ggml-{}-{suffix}.bin", self.name),
        )
    }

    /// Full path of the weight file
    ///
    /// # Errors
    /// Returns error if `dir` starts with `~/` and HOME is unset
    pub fn model_path(&self) -> Result<PathBuf> {
        Ok(Config::expand_path(&self.dir)?.join(self.file_name()))
    }
}

/// Per-request transcription settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Language used when the request carries none (`auto` = detect)
    pub default_language: String,
    /// Upper bound on model construction
    pub load_timeout_secs: u64,
    /// Upper bound on a single inference call
    pub timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            default_language: "auto".to_owned(),
            load_timeout_secs: 600,
            timeout_secs: 120,
        }
    }
}

impl TranscriptionConfig {
    /// Load timeout as a `Duration`
    #[must_use]
    pub const fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    /// Inference timeout as a `Duration`
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Temporary upload storage
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UploadsConfig {
    /// Directory for per-request audio files
    pub dir: String,
    /// Age after which a leftover upload is swept at startup
    pub stale_after_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: "uploads".to_owned(),
            stale_after_secs: 3600,
        }
    }
}

/// Logging
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Write logs to `log_path` instead of stdout
    pub enabled: bool,
    /// Log file location
    pub log_path: String,
    /// Default `EnvFilter` directive (`RUST_LOG` takes precedence)
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.whisper-service/service.log".to_owned(),
            filter: "info".to_owned(),
        }
    }
}

impl Config {
    /// Load config from `$WHISPER_SERVICE_CONFIG` or ~/.whisper-service.toml,
    /// then apply `WHISPER_MODEL` and `PORT` overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be created, read, or parsed, or if `PORT` is not a port number
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        let mut config = Self::from_file(&config_path)?;
        config.apply_env_overrides(std::env::var(MODEL_ENV).ok(), std::env::var(PORT_ENV).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings that would only fail later, per request
    ///
    /// # Errors
    /// Returns error if `transcription.default_language` is not `auto` or a 2–3 letter code
    pub fn validate(&self) -> Result<()> {
        let default_language = &self.transcription.default_language;
        if normalize_code(default_language).is_none() {
            anyhow::bail!(
                "invalid transcription.default_language {default_language:?}: expected \"auto\" or a 2-3 letter code"
            );
        }
        Ok(())
    }

    /// Parse a config file without applying environment overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        toml::from_str(&contents).context("failed to parse config TOML")
    }

    /// Apply model and port overrides taken from the environment
    ///
    /// # Errors
    /// Returns error if `port` is not a valid port number
    pub fn apply_env_overrides(&mut self, model: Option<String>, port: Option<String>) -> Result<()> {
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            self.model.name = model.trim().to_owned();
        }

        if let Some(port) = port.filter(|p| !p.trim().is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {PORT_ENV} value: {port}"))?;
        }

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::expand_path(&path);
        }
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".whisper-service.toml"))
    }

    fn create_default(path: &Path) -> Result<()> {
        let default_config = r#"[server]
host = "0.0.0.0"
port = 8765
max_upload_bytes = 10485760

[model]
# tiny is ~4x faster than base; WHISPER_MODEL overrides this
name = "tiny"
dir = "~/.whisper-service/models"
device = "auto"        # auto | cpu | gpu
compute_type = "auto"  # auto | q5_0 | q5_1 | q8_0
threads = 4
beam_size = 5
preload = true
download = true
# vad_model = "~/.whisper-service/models/ggml-silero-v5.1.2.bin"
vad_min_silence_ms = 500

[transcription]
default_language = "auto"
load_timeout_secs = 600
timeout_secs = 120

[uploads]
dir = "uploads"
stale_after_secs = 3600

[telemetry]
enabled = false
log_path = "~/.whisper-service/service.log"
filter = "info"
"#;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path, default_config).context("failed to write default config")?;
        Ok(())
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and HOME is unset
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_python_service() {
        let config = Config::default();
        assert_eq!(config.model.name, "tiny");
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.model.beam_size, 5);
        assert_eq!(config.transcription.default_language, "auto");
        assert!(config.model.preload);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[model]
name = "base"
device = "cpu"
compute_type = "q5_1"
"#,
        )
        .unwrap();

        assert_eq!(config.model.name, "base");
        assert_eq!(config.model.device, Device::Cpu);
        assert_eq!(config.model.compute_type, ComputeType::Q5_1);
        assert_eq!(config.model.threads, 4);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.uploads.dir, "uploads");
    }

    #[test]
    fn test_empty_toml_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.model.name, "tiny");
    }

    #[test]
    fn test_unknown_device_rejected() {
        let result: Result<Config, _> = toml::from_str("[model]\ndevice = \"tpu\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(Some("small".to_owned()), Some("9000".to_owned()))
            .unwrap();
        assert_eq!(config.model.name, "small");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_env_overrides_ignore_blank_values() {
        let mut config = Config::default();
        config
            .apply_env_overrides(Some("  ".to_owned()), None)
            .unwrap();
        assert_eq!(config.model.name, "tiny");
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(None, Some("eighty".to_owned()));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid PORT value"));
    }

    #[test]
    fn test_model_file_name() {
        let mut model = ModelConfig {
            name: "base".to_owned(),
            ..ModelConfig::default()
        };
        assert_eq!(model.file_name(), "ggml-base.bin");

        model.compute_type = ComputeType::Q8_0;
        assert_eq!(model.file_name(), "ggml-base-q8_0.bin");
    }

    #[test]
    fn test_device_gpu_preference() {
        assert!(Device::Auto.use_gpu());
        assert!(Device::Gpu.use_gpu());
        assert!(!Device::Cpu.use_gpu());
        assert_eq!(Device::Auto.as_str(), "auto");
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let result = Config::expand_path("/opt/models").unwrap();
        assert_eq!(result, PathBuf::from("/opt/models"));
    }

    #[test]
    fn test_validate_default_language() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.transcription.default_language = "es".to_owned();
        assert!(config.validate().is_ok());

        config.transcription.default_language = "english".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_language"));
    }

    #[test]
    fn test_vad_settings() {
        let config: Config = toml::from_str(
            r#"
[model]
vad_model = "~/models/silero.bin"
"#,
        )
        .unwrap();
        assert_eq!(config.model.vad_model.as_deref(), Some("~/models/silero.bin"));
        assert_eq!(config.model.vad_min_silence_ms, 500);
        assert!(Config::default().model.vad_model.is_none());
    }

    #[test]
    fn test_default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::create_default(&path).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.model.name, "tiny");
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.transcription.timeout_secs, 120);
    }
}
