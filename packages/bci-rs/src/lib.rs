pub mod buffer;
pub mod classifier;
pub mod config;
pub mod epoch;
pub mod error;
pub mod features;
pub mod filters;
pub mod session;
pub mod source;
pub mod types;

pub use buffer::{DecisionBuffer, StreamBuffer};
pub use classifier::{train, NormalizationParams, TrainedClassifier};
pub use config::{ClientConfig, PipelineConfig};
pub use epoch::{epoch, epoch_count};
pub use error::{StreamError, StreamResult};
pub use features::{FeatureExtractor, BAND_NAMES, MIN_BAND_POWER};
pub use filters::{mains_notch, FilterState, SosCoefficients};
pub use session::{Calibration, OnlineSession, SessionSummary, SessionUpdate};
pub use source::codec::Command;
pub use source::{create_source, MulesClient, Recording, ReplaySource, SampleSource, SourceConfig};
pub use types::{Decision, DeviceParams, FormatCode, SampleChunk};
