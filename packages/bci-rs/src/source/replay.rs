// Replay source that serves a pre-recorded session
//
// Useful for:
// - Calibrating and testing the online loop without hardware
// - Re-running recorded sessions through a new classifier

use super::SampleSource;
use crate::config::seconds_to_samples;
use crate::error::{StreamError, StreamResult};
use crate::types::{DeviceParams, FormatCode, SampleChunk};
use async_trait::async_trait;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};

/// Recording stored on disk as JSON, one inner array per sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    #[serde(default = "default_recording_name")]
    pub name: String,
    pub fs: f64,
    pub channel_names: Vec<String>,
    pub samples: Vec<Vec<f64>>,
}

fn default_recording_name() -> String {
    "REPLAY".to_string()
}

impl Recording {
    pub fn from_params(params: &DeviceParams, samples: ArrayView2<f64>) -> Self {
        Self {
            name: params.name.clone(),
            fs: params.fs,
            channel_names: params.channel_names.clone(),
            samples: samples.outer_iter().map(|row| row.to_vec()).collect(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> StreamResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> StreamResult<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Device parameters and the `[n_samples, n_columns]` sample matrix
    pub fn into_parts(self) -> StreamResult<(DeviceParams, Array2<f64>)> {
        if !(self.fs.is_finite() && self.fs > 0.0) {
            return Err(StreamError::InvalidInput(format!(
                "Recording sampling rate must be positive, got {}",
                self.fs
            )));
        }

        let n_columns = self.channel_names.len();
        let n_samples = self.samples.len();
        if let Some(row) = self.samples.iter().find(|row| row.len() != n_columns) {
            return Err(StreamError::shape(
                format!("{} values per sample", n_columns),
                format!("{} values", row.len()),
            ));
        }

        let samples = Array2::from_shape_vec(
            (n_samples, n_columns),
            self.samples.into_iter().flatten().collect(),
        )
        .map_err(|e| StreamError::InvalidInput(format!("Recording shape: {}", e)))?;

        let params = DeviceParams {
            name: self.name,
            hardware: "replay".to_string(),
            fs: self.fs,
            data_format: vec![FormatCode::Float32; n_columns],
            channel_count: n_columns,
            channel_names: self.channel_names,
        };

        Ok((params, samples))
    }
}

enum Origin {
    File(PathBuf),
    Memory {
        params: DeviceParams,
        samples: Array2<f64>,
    },
}

pub struct ReplaySource {
    origin: Origin,
    rate_limit_ms: Option<u64>,
    loop_playback: bool,
    params: Option<DeviceParams>,
    samples: Array2<f64>,
    position: usize,
    is_connected: bool,
}

impl ReplaySource {
    /// Serve an in-memory `[n_samples, n_columns]` matrix
    pub fn new(params: DeviceParams, samples: Array2<f64>) -> Self {
        Self::with_origin(Origin::Memory { params, samples })
    }

    /// Serve a JSON [`Recording`], loaded on connect
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::with_origin(Origin::File(path.into()))
    }

    fn with_origin(origin: Origin) -> Self {
        Self {
            origin,
            rate_limit_ms: None,
            loop_playback: false,
            params: None,
            samples: Array2::zeros((0, 0)),
            position: 0,
            is_connected: false,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit_ms: Option<u64>) -> Self {
        self.rate_limit_ms = rate_limit_ms;
        self
    }

    pub fn with_looping(mut self, loop_playback: bool) -> Self {
        self.loop_playback = loop_playback;
        self
    }

    /// Index of the next sample to be served
    pub fn position(&self) -> usize {
        self.position
    }

    async fn load(&self) -> StreamResult<(DeviceParams, Array2<f64>)> {
        match &self.origin {
            Origin::Memory { params, samples } => {
                if samples.ncols() != params.n_columns() {
                    return Err(StreamError::shape(
                        format!("{} columns", params.n_columns()),
                        format!("{} columns", samples.ncols()),
                    ));
                }
                Ok((params.clone(), samples.clone()))
            }
            Origin::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || Recording::load(path)?.into_parts())
                    .await
                    .map_err(|e| {
                        StreamError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                    })?
            }
        }
    }
}

#[async_trait]
impl SampleSource for ReplaySource {
    async fn connect(&mut self) -> StreamResult<()> {
        if self.is_connected {
            return Ok(());
        }

        let (params, samples) = self.load().await?;

        log::info!(
            "Replaying {}: {} samples x {} columns @ {} Hz",
            params.name,
            samples.nrows(),
            samples.ncols(),
            params.fs
        );

        self.params = Some(params);
        self.samples = samples;
        self.position = 0;
        self.is_connected = true;

        Ok(())
    }

    async fn read_chunk(&mut self, min_seconds: f64) -> StreamResult<SampleChunk> {
        let fs = match (&self.params, self.is_connected) {
            (Some(params), true) => params.fs,
            _ => {
                return Err(StreamError::Connection(
                    "Replay source is not connected".to_string(),
                ))
            }
        };

        let target = seconds_to_samples(min_seconds, fs);
        let total = self.samples.nrows();
        if target == 0 {
            return Ok(SampleChunk::new(Array2::zeros((0, self.samples.ncols()))));
        }

        let mut pieces: Vec<ArrayView2<f64>> = Vec::new();
        let mut collected = 0;
        while collected < target && total > 0 {
            if self.position >= total {
                if !self.loop_playback {
                    break;
                }
                log::debug!("Replay looped back to the start");
                self.position = 0;
            }
            let take = (target - collected).min(total - self.position);
            pieces.push(self.samples.slice(s![self.position..self.position + take, ..]));
            self.position += take;
            collected += take;
        }

        if collected == 0 {
            return Err(StreamError::EndOfStream);
        }

        let samples = concatenate(Axis(0), &pieces)
            .map_err(|e| StreamError::InvalidInput(format!("Replay chunk: {}", e)))?;

        if let Some(delay_ms) = self.rate_limit_ms {
            sleep(Duration::from_millis(delay_ms)).await;
        }

        Ok(SampleChunk::new(samples))
    }

    async fn stop(&mut self) -> StreamResult<()> {
        log::info!("Stopping replay");
        self.is_connected = false;
        self.position = 0;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected
    }

    fn params(&self) -> Option<&DeviceParams> {
        self.params.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n_columns: usize) -> DeviceParams {
        DeviceParams {
            name: "TEST".to_string(),
            hardware: "replay".to_string(),
            fs: 10.0,
            data_format: vec![FormatCode::Float32; n_columns],
            channel_count: n_columns,
            channel_names: (0..n_columns).map(|i| format!("CH{}", i)).collect(),
        }
    }

    fn counting(n_samples: usize) -> Array2<f64> {
        Array2::from_shape_fn((n_samples, 2), |(i, j)| (i * 2 + j) as f64)
    }

    #[tokio::test]
    async fn test_chunks_until_exhausted() {
        let mut source = ReplaySource::new(params(2), counting(25));
        source.connect().await.unwrap();

        let first = source.read_chunk(1.0).await.unwrap();
        assert_eq!(first.num_samples(), 10);
        assert_eq!(first.samples[[0, 0]], 0.0);

        source.read_chunk(1.0).await.unwrap();
        let last = source.read_chunk(1.0).await.unwrap();
        assert_eq!(last.num_samples(), 5);
        assert_eq!(last.samples[[4, 1]], 49.0);

        assert!(matches!(
            source.read_chunk(1.0).await,
            Err(StreamError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_looping_wraps_around() {
        let mut source = ReplaySource::new(params(2), counting(6)).with_looping(true);
        source.connect().await.unwrap();

        let chunk = source.read_chunk(1.0).await.unwrap();
        assert_eq!(chunk.num_samples(), 10);
        assert_eq!(chunk.samples[[6, 0]], 0.0);
        assert_eq!(source.position(), 4);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mut source = ReplaySource::new(params(2), counting(6));
        assert!(matches!(
            source.read_chunk(0.5).await,
            Err(StreamError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_recording_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        Recording::from_params(&params(2), counting(4).view())
            .save(&path)
            .unwrap();

        let mut source = ReplaySource::from_file(&path);
        source.connect().await.unwrap();
        assert_eq!(source.params().unwrap().channel_names, vec!["CH0", "CH1"]);

        let chunk = source.read_chunk(0.4).await.unwrap();
        assert_eq!(chunk.samples, counting(4));
    }

    #[test]
    fn test_ragged_recording_rejected() {
        let recording = Recording {
            name: "TEST".to_string(),
            fs: 10.0,
            channel_names: vec!["A".to_string(), "B".to_string()],
            samples: vec![vec![1.0, 2.0], vec![3.0]],
        };
        assert!(matches!(
            recording.into_parts(),
            Err(StreamError::ShapeMismatch { .. })
        ));
    }
}
