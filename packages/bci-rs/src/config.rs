//! Pipeline configuration
//!
//! All durations are expressed in seconds and converted to sample counts with
//! the device sampling rate once it is known.

use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Connection settings for the acquisition server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Pause between data requests that returned no samples (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for a single `get_data` call (ms); None waits indefinitely
    #[serde(default)]
    pub data_timeout_ms: Option<u64>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    30000
}
fn default_poll_interval_ms() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            data_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load connection settings from `BCI_*` environment variables
    pub fn from_env() -> StreamResult<Self> {
        let defaults = Self::default();

        let port = match env::var("BCI_PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| StreamError::InvalidConfig(format!("BCI_PORT={:?}", v)))?,
            Err(_) => defaults.port,
        };
        let poll_interval_ms = match env::var("BCI_POLL_INTERVAL_MS") {
            Ok(v) => v.parse().map_err(|_| {
                StreamError::InvalidConfig(format!("BCI_POLL_INTERVAL_MS={:?}", v))
            })?,
            Err(_) => defaults.poll_interval_ms,
        };
        let data_timeout_ms = match env::var("BCI_DATA_TIMEOUT_MS") {
            Ok(v) => Some(v.parse().map_err(|_| {
                StreamError::InvalidConfig(format!("BCI_DATA_TIMEOUT_MS={:?}", v))
            })?),
            Err(_) => defaults.data_timeout_ms,
        };

        Ok(Self {
            host: env::var("BCI_HOST").unwrap_or(defaults.host),
            port,
            poll_interval_ms,
            data_timeout_ms,
        })
    }
}

/// Windowing, buffering and preprocessing parameters of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub client: ClientConfig,

    /// Seconds of data recorded for each class during calibration
    #[serde(default = "default_training_secs")]
    pub training_secs: f64,

    /// Length of one epoch / test window
    #[serde(default = "default_epoch_secs")]
    pub epoch_secs: f64,

    /// Overlap between consecutive epochs
    #[serde(default = "default_overlap_secs")]
    pub overlap_secs: f64,

    /// Length of the raw-sample ring buffer
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: f64,

    /// Number of past decisions kept for consumers
    #[serde(default = "default_decision_buffer_len")]
    pub decision_buffer_len: usize,

    /// Apply the mains notch filter as samples enter the ring buffer
    #[serde(default)]
    pub notch_enabled: bool,

    /// Treat the last column as a status/trigger channel and skip it in features
    #[serde(default = "default_drop_status_column")]
    pub drop_status_column: bool,
}

fn default_training_secs() -> f64 {
    20.0
}
fn default_epoch_secs() -> f64 {
    1.0
}
fn default_overlap_secs() -> f64 {
    0.7
}
fn default_buffer_secs() -> f64 {
    30.0
}
fn default_decision_buffer_len() -> usize {
    30
}
fn default_drop_status_column() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            training_secs: default_training_secs(),
            epoch_secs: default_epoch_secs(),
            overlap_secs: default_overlap_secs(),
            buffer_secs: default_buffer_secs(),
            decision_buffer_len: default_decision_buffer_len(),
            notch_enabled: false,
            drop_status_column: default_drop_status_column(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> StreamResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject windowing parameters that cannot produce epochs
    pub fn validate(&self) -> StreamResult<()> {
        if !(self.epoch_secs > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "epoch_secs must be positive, got {}",
                self.epoch_secs
            )));
        }
        if self.overlap_secs < 0.0 || self.overlap_secs >= self.epoch_secs {
            return Err(StreamError::InvalidConfig(format!(
                "overlap_secs must be in [0, {}), got {}",
                self.epoch_secs, self.overlap_secs
            )));
        }
        if self.buffer_secs < self.epoch_secs {
            return Err(StreamError::InvalidConfig(format!(
                "buffer_secs ({}) must hold at least one epoch ({})",
                self.buffer_secs, self.epoch_secs
            )));
        }
        if !(self.training_secs > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "training_secs must be positive, got {}",
                self.training_secs
            )));
        }
        if self.decision_buffer_len == 0 {
            return Err(StreamError::InvalidConfig(
                "decision_buffer_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Time between consecutive epochs
    pub fn shift_secs(&self) -> f64 {
        self.epoch_secs - self.overlap_secs
    }

    pub fn samples_per_epoch(&self, fs: f64) -> usize {
        seconds_to_samples(self.epoch_secs, fs)
    }

    pub fn samples_overlap(&self, fs: f64) -> usize {
        seconds_to_samples(self.overlap_secs, fs)
    }

    pub fn buffer_samples(&self, fs: f64) -> usize {
        seconds_to_samples(self.buffer_secs, fs)
    }
}

/// Convert a duration to a sample count, rounding to the nearest sample
pub fn seconds_to_samples(seconds: f64, fs: f64) -> usize {
    (seconds * fs).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.samples_per_epoch(256.0), 256);
        assert_eq!(config.samples_overlap(256.0), 179);
        assert_eq!(config.buffer_samples(256.0), 7680);
        assert!((config.shift_secs() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let config =
            PipelineConfig::from_json_str(r#"{"notch_enabled": true, "client": {"port": 31000}}"#)
                .unwrap();
        assert!(config.notch_enabled);
        assert_eq!(config.client.port, 31000);
        assert_eq!(config.client.host, "127.0.0.1");
        assert_eq!(config.epoch_secs, 1.0);
    }

    #[test]
    fn test_overlap_must_be_shorter_than_epoch() {
        let err = PipelineConfig::from_json_str(r#"{"epoch_secs": 1.0, "overlap_secs": 1.0}"#)
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"buffer_secs": 10.0, "decision_buffer_len": 5}"#).unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.buffer_secs, 10.0);
        assert_eq!(config.decision_buffer_len, 5);
    }
}
