// Error types shared by the acquisition, buffering, feature and classifier layers

use thiserror::Error;

/// Result type for pipeline operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while acquiring, buffering or classifying samples
#[derive(Debug, Error)]
pub enum StreamError {
    /// Failure to establish or keep the TCP session with the acquisition server
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed length prefix or stream closed before the full message arrived
    #[error("Framing error: {0}")]
    Framing(String),

    /// Well-framed payload that does not match the acquisition protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A computation that would otherwise produce NaN or infinities
    #[error("Numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A finite source has no more samples to deliver
    #[error("End of stream")]
    EndOfStream,
}

impl StreamError {
    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether the failure leaves the transport unusable until the caller reconnects
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Framing(_) | Self::Io(_) | Self::Timeout(_)
        )
    }
}
