// Pluggable sample sources
//
// A `SampleSource` delivers blocks of `[n_samples, n_columns]` samples on
// request. The online session only talks to this trait, so recorded data can be
// replayed through the same loop that drives a live acquisition server.
//
// Current implementations:
// - MuLES: binary TCP protocol of the acquisition server
// - Replay: pre-recorded matrix served in chunks

pub mod codec;
mod mules;
mod replay;

use crate::config::ClientConfig;
use crate::error::StreamResult;
use crate::types::{DeviceParams, SampleChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use mules::MulesClient;
pub use replay::{Recording, ReplaySource};

/// Configuration for the available source types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Live acquisition server
    #[serde(rename = "mules")]
    Mules(ClientConfig),

    /// Recording stored as JSON (see [`Recording`])
    #[serde(rename = "replay")]
    Replay {
        path: String,
        /// Delay after every chunk in milliseconds (simulates real time)
        #[serde(default)]
        rate_limit_ms: Option<u64>,
        /// Start over when the recording is exhausted
        #[serde(default)]
        loop_playback: bool,
    },
}

/// Trait for everything that can feed samples into the pipeline
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Establish the connection and negotiate device parameters
    async fn connect(&mut self) -> StreamResult<()>;

    /// Read at least `min_seconds` of new samples
    ///
    /// Sources return exactly `round(min_seconds * fs)` rows unless they run out
    /// of data, in which case the remainder is returned and the following call
    /// fails with `EndOfStream`.
    async fn read_chunk(&mut self, min_seconds: f64) -> StreamResult<SampleChunk>;

    /// Discard samples buffered on the device side
    async fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    /// Stop streaming and close the connection
    async fn stop(&mut self) -> StreamResult<()>;

    fn is_connected(&self) -> bool;

    /// Device parameters, available once connected
    fn params(&self) -> Option<&DeviceParams>;
}

/// Build a sample source from its configuration
pub fn create_source(config: SourceConfig) -> StreamResult<Box<dyn SampleSource>> {
    match config {
        SourceConfig::Mules(client) => Ok(Box::new(MulesClient::new(client))),

        SourceConfig::Replay {
            path,
            rate_limit_ms,
            loop_playback,
        } => Ok(Box::new(
            ReplaySource::from_file(path)
                .with_rate_limit(rate_limit_ms)
                .with_looping(loop_playback),
        )),
    }
}

#[async_trait]
impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    async fn connect(&mut self) -> StreamResult<()> {
        (**self).connect().await
    }

    async fn read_chunk(&mut self, min_seconds: f64) -> StreamResult<SampleChunk> {
        (**self).read_chunk(min_seconds).await
    }

    async fn flush(&mut self) -> StreamResult<()> {
        (**self).flush().await
    }

    async fn stop(&mut self) -> StreamResult<()> {
        (**self).stop().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn params(&self) -> Option<&DeviceParams> {
        (**self).params()
    }
}
