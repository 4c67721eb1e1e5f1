// Common types for device metadata and sample chunks

use crate::error::{StreamError, StreamResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Width in bytes of every element of a binary data payload
pub const ELEMENT_WIDTH: usize = 4;

/// Numeric encoding of one column of the binary data payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatCode {
    /// 32-bit IEEE float (`f`)
    Float32,
    /// 32-bit signed integer (`i` or `l`)
    Int32,
    /// 32-bit unsigned integer (`I` or `L`)
    UInt32,
}

impl FormatCode {
    pub fn from_tag(tag: char) -> StreamResult<Self> {
        match tag {
            'f' => Ok(Self::Float32),
            'i' | 'l' => Ok(Self::Int32),
            'I' | 'L' => Ok(Self::UInt32),
            other => Err(StreamError::Protocol(format!(
                "Unsupported data format code '{}'",
                other
            ))),
        }
    }

    pub fn tag(&self) -> char {
        match self {
            Self::Float32 => 'f',
            Self::Int32 => 'i',
            Self::UInt32 => 'I',
        }
    }

    /// Parse a data-format string such as `"ffffi"`, one code per column
    pub fn parse_sequence(format: &str) -> StreamResult<Vec<Self>> {
        let codes = format
            .trim()
            .chars()
            .map(Self::from_tag)
            .collect::<StreamResult<Vec<_>>>()?;

        if codes.is_empty() {
            return Err(StreamError::Protocol("Empty data format".to_string()));
        }

        Ok(codes)
    }
}

/// Static description of the acquisition device, negotiated once at connection time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Device name (e.g. "MUSE")
    pub name: String,

    /// Hardware identifier
    pub hardware: String,

    /// Sampling frequency in Hz
    pub fs: f64,

    /// One format code per column of the data payload
    pub data_format: Vec<FormatCode>,

    /// Channel count as announced by the header
    pub channel_count: usize,

    /// Channel labels, in column order
    pub channel_names: Vec<String>,
}

impl DeviceParams {
    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Number of columns in every decoded sample matrix
    pub fn n_columns(&self) -> usize {
        self.data_format.len()
    }

    /// Data format rendered back into its single-character tags
    pub fn data_format_tags(&self) -> String {
        self.data_format.iter().map(FormatCode::tag).collect()
    }
}

/// A chunk of samples from a sample source
#[derive(Debug, Clone)]
pub struct SampleChunk {
    /// Samples [n_samples, n_columns], oldest row first
    pub samples: Array2<f64>,

    /// Unix timestamp (seconds) when this chunk was received
    pub timestamp: f64,
}

impl SampleChunk {
    pub fn new(samples: Array2<f64>) -> Self {
        Self {
            samples,
            timestamp: unix_now(),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.samples.nrows()
    }
}

/// Binary classifier output
pub type Decision = u8;

pub(crate) fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_millis() as f64 / 1000.0
}
