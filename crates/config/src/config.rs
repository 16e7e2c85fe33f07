//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Highest constant-quality value accepted by the NVENC encoders.
pub const MAX_CQ: u32 = 51;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is outside its accepted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Encoder invocation and output naming settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Constant-quality value of the first attempt for every file
    #[serde(default = "default_initial_cq")]
    pub initial_cq: u32,
    /// Amount the cq drops on each quality-driven retry
    #[serde(default = "default_cq_step")]
    pub cq_step: u32,
    /// Directory receiving the encoded files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Extension (with leading dot) of every encoded file
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_rate_control")]
    pub rate_control: String,
    /// Audio channel count of the output (1 squashes to mono)
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u32,
    /// Copy container metadata from the source
    #[serde(default = "default_map_metadata")]
    pub map_metadata: bool,
}

fn default_initial_cq() -> u32 {
    40
}

fn default_cq_step() -> u32 {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./out")
}

fn default_output_extension() -> String {
    ".mkv".to_string()
}

fn default_video_codec() -> String {
    "hevc_nvenc".to_string()
}

fn default_preset() -> String {
    "slow".to_string()
}

fn default_rate_control() -> String {
    "vbr".to_string()
}

fn default_audio_channels() -> u32 {
    1
}

fn default_map_metadata() -> bool {
    true
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            initial_cq: default_initial_cq(),
            cq_step: default_cq_step(),
            output_dir: default_output_dir(),
            output_extension: default_output_extension(),
            video_codec: default_video_codec(),
            preset: default_preset(),
            rate_control: default_rate_control(),
            audio_channels: default_audio_channels(),
            map_metadata: default_map_metadata(),
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    /// Minimum VMAF score (0-100) for a candidate to be accepted
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Threads handed to libvmaf (0 = auto-detect)
    #[serde(default)]
    pub threads: u32,
    /// Give up on a file after this many unmeasurable results (unset = retry forever)
    #[serde(default)]
    pub max_measure_attempts: Option<u32>,
}

fn default_threshold() -> f64 {
    95.0
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            threads: 0,
            max_measure_attempts: None,
        }
    }
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Parallel encode workers (0 = auto)
    #[serde(default = "default_pool_size")]
    pub encode: u32,
    /// Parallel VMAF workers (0 = auto)
    #[serde(default = "default_pool_size")]
    pub quality: u32,
}

fn default_pool_size() -> u32 {
    1
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            encode: default_pool_size(),
            quality: default_pool_size(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TRANSCODE_INITIAL_CQ -> encode.initial_cq
    /// - TRANSCODE_CQ_STEP -> encode.cq_step
    /// - TRANSCODE_OUTPUT_DIR -> encode.output_dir
    /// - VMAF_THRESHOLD -> quality.threshold
    /// - VMAF_THREADS -> quality.threads
    /// - VMAF_MAX_MEASURE_ATTEMPTS -> quality.max_measure_attempts
    /// - TRANSCODE_WORKERS -> workers.encode
    /// - VMAF_WORKERS -> workers.quality
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(cq) = env_parse::<u32>("TRANSCODE_INITIAL_CQ") {
            self.encode.initial_cq = cq;
        }

        if let Some(step) = env_parse::<u32>("TRANSCODE_CQ_STEP") {
            self.encode.cq_step = step;
        }

        if let Ok(dir) = env::var("TRANSCODE_OUTPUT_DIR") {
            if !dir.is_empty() {
                self.encode.output_dir = PathBuf::from(dir);
            }
        }

        if let Some(threshold) = env_parse::<f64>("VMAF_THRESHOLD") {
            self.quality.threshold = threshold;
        }

        if let Some(threads) = env_parse::<u32>("VMAF_THREADS") {
            self.quality.threads = threads;
        }

        if let Some(attempts) = env_parse::<u32>("VMAF_MAX_MEASURE_ATTEMPTS") {
            // 0 reads as "no cap", matching an absent key in the file
            self.quality.max_measure_attempts = (attempts > 0).then_some(attempts);
        }

        if let Some(workers) = env_parse::<u32>("TRANSCODE_WORKERS") {
            self.workers.encode = workers;
        }

        if let Some(workers) = env_parse::<u32>("VMAF_WORKERS") {
            self.workers.quality = workers;
        }
    }

    /// Check that every value is within its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encode.initial_cq > MAX_CQ {
            return Err(ConfigError::Invalid(format!(
                "encode.initial_cq must be within 0..={}, got {}",
                MAX_CQ, self.encode.initial_cq
            )));
        }

        if self.encode.cq_step == 0 {
            return Err(ConfigError::Invalid(
                "encode.cq_step must be at least 1".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.quality.threshold) {
            return Err(ConfigError::Invalid(format!(
                "quality.threshold must be within 0..=100, got {}",
                self.quality.threshold
            )));
        }

        if !self.encode.output_extension.starts_with('.') || self.encode.output_extension.len() < 2
        {
            return Err(ConfigError::Invalid(format!(
                "encode.output_extension must look like \".mkv\", got {:?}",
                self.encode.output_extension
            )));
        }

        if self.quality.max_measure_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "quality.max_measure_attempts must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
