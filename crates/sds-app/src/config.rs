//! Pipeline configuration
//!
//! Loaded from an optional TOML file, then `SDS_`-prefixed environment
//! variables (`SDS_POLL__PERIOD_MS=50`), then validated.

use feature_engine::WindowConfig;
use inference_engine::{check_wakeups, ConsumerConfig};
use recorder::CHUNK_HEADER_SIZE;
use sensor_poll::{ImuConfig, PollConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Sensor stream geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Ring buffer size in bytes
    pub capacity: usize,
    /// High-watermark in bytes
    pub threshold: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        // 2048 floats, watermark at 512 floats
        Self {
            capacity: 8192,
            threshold: 2048,
        }
    }
}

/// Record/replay session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Directory holding `<name>.<index>.sds` recordings
    pub dir: PathBuf,
    /// Session buffer size in bytes
    pub buffer_size: usize,
    /// Bytes moved to or from storage per I/O pass
    pub io_threshold: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("recordings"),
            buffer_size: 8192,
            io_threshold: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub stream: StreamConfig,
    pub poll: PollConfig,
    pub imu: ImuConfig,
    pub window: WindowConfig,
    pub consumer: ConsumerConfig,
    pub record: RecordConfig,
}

impl PipelineConfig {
    /// Load from `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let mut config: Self = builder
            .add_source(
                ::config::Environment::with_prefix("SDS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the individual sections cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.stream.capacity == 0 || self.stream.threshold > self.stream.capacity {
            return Err(ConfigError::Invalid(format!(
                "stream threshold {} must not exceed capacity {}",
                self.stream.threshold, self.stream.capacity
            )));
        }
        if self.stream.capacity < self.window.shift_bytes() {
            return Err(ConfigError::Invalid(format!(
                "stream capacity {} cannot hold one {}-byte shift increment",
                self.stream.capacity,
                self.window.shift_bytes()
            )));
        }
        check_wakeups(
            self.stream.threshold,
            self.window.shift_bytes(),
            self.consumer.wait_timeout_ms,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.poll.period_ms == 0 || self.poll.max_batch == 0 {
            return Err(ConfigError::Invalid(
                "poll period and batch size must be non-zero".to_string(),
            ));
        }
        if self.record.io_threshold == 0
            || self.record.io_threshold > self.record.buffer_size
            || self.record.buffer_size <= CHUNK_HEADER_SIZE
        {
            return Err(ConfigError::Invalid(format!(
                "record I/O threshold {} must be within 1..={}",
                self.record.io_threshold, self.record.buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll.period_ms, 100);
        assert_eq!(config.stream.capacity, 8192);
        assert_eq!(config.window.shift_bytes(), 1200);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n\n[window]\nlength = 50\nshift = 25\n\n[stream]\nthreshold = 600"
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.window.length, 50);
        assert_eq!(config.window.channels, 3);
        assert_eq!(config.stream.threshold, 600);
        assert_eq!(config.stream.capacity, 8192);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut config = PipelineConfig::default();
        config.window.shift = 30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.stream.threshold = 10_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = PipelineConfig::default();
        config.stream.capacity = 1024;
        config.stream.threshold = 512;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_watermark_below_shift() {
        let mut config = PipelineConfig::default();
        config.stream.threshold = config.window.shift_bytes() - 4;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.stream.threshold = config.window.shift_bytes();
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_watermark_needs_timeout() {
        let mut config = PipelineConfig::default();
        config.stream.threshold = 0;
        config.validate().unwrap();

        config.consumer.wait_timeout_ms = None;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
