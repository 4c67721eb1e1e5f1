// Calibration and online classification loop
//
// Calibration records one block of data per mental state, epochs both, extracts
// band-power features and trains the classifier. The online session then owns
// the raw-sample ring buffer and filter state and, every shift interval:
// - reads the newest samples from the source
// - appends them to the ring buffer (optionally notch filtered)
// - classifies the newest epoch
// - publishes the decision
//
// Cancellation is cooperative through a CancellationToken; on cancel the source
// is stopped, which closes the connection.

use crate::buffer::{DecisionBuffer, StreamBuffer};
use crate::classifier::{train, TrainedClassifier};
use crate::config::PipelineConfig;
use crate::epoch::epoch;
use crate::error::{StreamError, StreamResult};
use crate::features::FeatureExtractor;
use crate::filters::{mains_notch, ButterworthBandstop, FilterState, SosCoefficients};
use crate::filters::{MAINS_NOTCH_BAND, MAINS_NOTCH_FS, MAINS_NOTCH_ORDER};
use crate::source::SampleSource;
use crate::types::{unix_now, Decision};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Feature extractor matching the pipeline's status-column setting
pub fn feature_extractor(
    config: &PipelineConfig,
    fs: f64,
    n_columns: usize,
) -> StreamResult<FeatureExtractor> {
    let extractor = FeatureExtractor::new(fs);
    if !config.drop_status_column {
        return Ok(extractor);
    }
    if n_columns < 2 {
        return Err(StreamError::InvalidConfig(format!(
            "drop_status_column needs at least one EEG column besides the status column, got {} columns",
            n_columns
        )));
    }
    Ok(extractor.with_status_column(n_columns - 1))
}

/// Mains notch for `fs`; the shared design is reused at its native rate
fn notch_for(fs: f64) -> StreamResult<SosCoefficients> {
    if fs == MAINS_NOTCH_FS {
        return Ok(mains_notch().clone());
    }
    let (low, high) = MAINS_NOTCH_BAND;
    log::info!("Designing mains notch for {} Hz", fs);
    ButterworthBandstop::design(low, high, fs, MAINS_NOTCH_ORDER)
}

/// Flush the source and record `seconds` of fresh samples for one class
pub async fn record_training<S: SampleSource + ?Sized>(
    source: &mut S,
    seconds: f64,
) -> StreamResult<Array2<f64>> {
    source.flush().await?;
    let chunk = source.read_chunk(seconds).await?;
    log::info!(
        "Recorded {} training samples ({} s requested)",
        chunk.num_samples(),
        seconds
    );
    Ok(chunk.samples)
}

/// Classifier trained from one recording per mental state
#[derive(Debug)]
pub struct Calibration {
    pub classifier: TrainedClassifier,
    pub features0: Array2<f64>,
    pub features1: Array2<f64>,
}

impl Calibration {
    /// Epoch both recordings, extract features and train
    pub fn fit(
        data0: ArrayView2<f64>,
        data1: ArrayView2<f64>,
        config: &PipelineConfig,
        fs: f64,
    ) -> StreamResult<Self> {
        config.validate()?;
        if data0.ncols() != data1.ncols() {
            return Err(StreamError::shape(
                format!("{} columns", data0.ncols()),
                format!("{} columns", data1.ncols()),
            ));
        }

        let extractor = feature_extractor(config, fs, data0.ncols())?;
        let samples_per_epoch = config.samples_per_epoch(fs);
        let samples_overlap = config.samples_overlap(fs);

        let features0 = extractor
            .compute_feature_matrix(epoch(data0, samples_per_epoch, samples_overlap)?.view())?;
        let features1 = extractor
            .compute_feature_matrix(epoch(data1, samples_per_epoch, samples_overlap)?.view())?;

        log::info!(
            "Calibration: {} epochs of class 0, {} epochs of class 1",
            features0.nrows(),
            features1.nrows()
        );

        let classifier = train(features0.view(), features1.view())?;

        Ok(Self {
            classifier,
            features0,
            features1,
        })
    }

    /// Record both classes from `source`, then fit
    pub async fn acquire<S: SampleSource + ?Sized>(
        source: &mut S,
        config: &PipelineConfig,
    ) -> StreamResult<Self> {
        let fs = source
            .params()
            .map(|p| p.fs)
            .ok_or_else(|| StreamError::Connection("Source is not connected".to_string()))?;

        log::info!("Recording class 0 for {} s", config.training_secs);
        let data0 = record_training(source, config.training_secs).await?;
        log::info!("Recording class 1 for {} s", config.training_secs);
        let data1 = record_training(source, config.training_secs).await?;

        Self::fit(data0.view(), data1.view(), config, fs)
    }
}

/// Published after every classified epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub iteration: u64,
    pub decision: Decision,
    pub features: Vec<f64>,
    pub timestamp: f64,
}

/// Totals of a finished online session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub iterations: u64,
    pub samples_received: u64,
    /// Number of decisions per class (0, 1)
    pub class_counts: [u64; 2],
    /// Most recent decisions, oldest first
    pub recent_decisions: Vec<Decision>,
    pub started_at: f64,
    pub stopped_at: f64,
}

/// Online acquisition and classification loop over a connected source
pub struct OnlineSession<S: SampleSource> {
    source: S,
    config: PipelineConfig,
    classifier: TrainedClassifier,
    extractor: FeatureExtractor,
    buffer: StreamBuffer,
    notch: Option<SosCoefficients>,
    filter_state: Option<FilterState>,
    decisions: DecisionBuffer,
    updates: Option<mpsc::Sender<SessionUpdate>>,
    samples_per_epoch: usize,
    iterations: u64,
    samples_received: u64,
    class_counts: [u64; 2],
}

impl<S: SampleSource> OnlineSession<S> {
    /// Build a session for a connected source and a trained classifier
    pub fn new(
        source: S,
        config: PipelineConfig,
        classifier: TrainedClassifier,
    ) -> StreamResult<Self> {
        config.validate()?;

        let params = source.params().ok_or_else(|| {
            StreamError::Connection(
                "Source must be connected before the session starts".to_string(),
            )
        })?;
        let fs = params.fs;
        let n_columns = params.n_columns();

        let extractor = feature_extractor(&config, fs, n_columns)?;
        let expected_features = extractor.n_features(n_columns)?;
        if classifier.n_features() != expected_features {
            return Err(StreamError::shape(
                format!("classifier for {} features", expected_features),
                format!("{} features", classifier.n_features()),
            ));
        }

        let notch = if config.notch_enabled {
            Some(notch_for(fs)?)
        } else {
            None
        };

        let buffer = StreamBuffer::zeros(config.buffer_samples(fs), n_columns);
        let decisions = DecisionBuffer::new(config.decision_buffer_len);
        let samples_per_epoch = config.samples_per_epoch(fs);

        log::info!(
            "Online session: {} Hz, {} columns, epoch {} samples, shift {} s, notch {}",
            fs,
            n_columns,
            samples_per_epoch,
            config.shift_secs(),
            if notch.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            source,
            config,
            classifier,
            extractor,
            buffer,
            notch,
            filter_state: None,
            decisions,
            updates: None,
            samples_per_epoch,
            iterations: 0,
            samples_received: 0,
            class_counts: [0; 2],
        })
    }

    /// Publish a [`SessionUpdate`] per decision; updates are dropped when the
    /// receiver lags behind
    pub fn with_updates(mut self, sender: mpsc::Sender<SessionUpdate>) -> Self {
        self.updates = Some(sender);
        self
    }

    /// Shared handle to the recent decisions
    pub fn decisions(&self) -> DecisionBuffer {
        self.decisions.clone()
    }

    pub fn buffer_snapshot(&self) -> Array2<f64> {
        self.buffer.snapshot()
    }

    pub fn filter_state(&self) -> Option<&FilterState> {
        self.filter_state.as_ref()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Read one shift of samples and classify the newest epoch
    pub async fn step(&mut self) -> StreamResult<Decision> {
        let chunk = self.source.read_chunk(self.config.shift_secs()).await?;
        self.samples_received += chunk.num_samples() as u64;

        match &self.notch {
            Some(notch) => {
                let state = self
                    .buffer
                    .append_notched(chunk.samples.view(), notch, self.filter_state.take())?;
                self.filter_state = Some(state);
            }
            None => self.buffer.append(chunk.samples.view())?,
        }

        let window = self.buffer.tail(self.samples_per_epoch)?;
        let features = self.extractor.compute_feature_vector(window)?;
        let decision = self.classifier.predict_one(features.view())?;

        self.iterations += 1;
        self.class_counts[usize::from(decision.min(1))] += 1;
        self.decisions.push(decision);

        log::debug!("Iteration {}: decision {}", self.iterations, decision);

        self.publish(SessionUpdate {
            iteration: self.iterations,
            decision,
            features: features.to_vec(),
            timestamp: chunk.timestamp,
        });

        Ok(decision)
    }

    fn publish(&mut self, update: SessionUpdate) {
        let Some(sender) = &self.updates else {
            return;
        };
        match sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                log::warn!("Update receiver lagging, dropped iteration {}", update.iteration);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Update receiver closed");
                self.updates = None;
            }
        }
    }

    fn summary(&self, started_at: f64) -> SessionSummary {
        SessionSummary {
            iterations: self.iterations,
            samples_received: self.samples_received,
            class_counts: self.class_counts,
            recent_decisions: self.decisions.snapshot(),
            started_at,
            stopped_at: unix_now(),
        }
    }

    /// Classify until `cancel` fires or the source runs out of data
    ///
    /// The source is stopped in every case. Transport, protocol and numeric
    /// failures end the loop and are returned.
    pub async fn run(&mut self, cancel: CancellationToken) -> StreamResult<SessionSummary> {
        let started_at = unix_now();

        if let Err(e) = self.source.flush().await {
            self.source.stop().await.ok();
            return Err(e);
        }

        loop {
            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => None,

                result = self.step() => Some(result),
            };

            match outcome {
                None => {
                    log::info!("Online session cancelled after {} iterations", self.iterations);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(StreamError::EndOfStream)) => {
                    log::info!("Source exhausted after {} iterations", self.iterations);
                    break;
                }
                Some(Err(e)) => {
                    log::error!("Online session stopped: {}", e);
                    if let Err(stop_err) = self.source.stop().await {
                        log::warn!("Failed to stop source: {}", stop_err);
                    }
                    return Err(e);
                }
            }
        }

        self.source.stop().await?;
        Ok(self.summary(started_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ReplaySource;
    use crate::types::{DeviceParams, FormatCode};
    use ndarray::s;
    use std::f64::consts::PI;

    const FS: f64 = 256.0;

    fn params() -> DeviceParams {
        DeviceParams {
            name: "SYNTH".to_string(),
            hardware: "test".to_string(),
            fs: FS,
            data_format: vec![
                FormatCode::Float32,
                FormatCode::Float32,
                FormatCode::Float32,
                FormatCode::Float32,
                FormatCode::Int32,
            ],
            channel_count: 5,
            channel_names: ["TP9", "AF7", "AF8", "TP10", "STATUS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Four EEG channels dominated by `freq` plus a slow drift, and a status column
    fn synthetic(freq: f64, seconds: f64) -> Array2<f64> {
        let n = (seconds * FS) as usize;
        Array2::from_shape_fn((n, 5), |(i, j)| {
            if j == 4 {
                return 0.0;
            }
            let t = i as f64 / FS;
            10.0 * (2.0 * PI * freq * t + j as f64).sin() + 2.0 * (2.0 * PI * 1.5 * t).sin()
        })
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            training_secs: 5.0,
            buffer_secs: 4.0,
            decision_buffer_len: 5,
            ..Default::default()
        }
    }

    fn calibrate() -> Calibration {
        let data0 = synthetic(10.0, 5.0);
        let data1 = synthetic(20.0, 5.0);
        Calibration::fit(data0.view(), data1.view(), &config(), FS).unwrap()
    }

    async fn connected_replay(data: Array2<f64>) -> ReplaySource {
        let mut source = ReplaySource::new(params(), data);
        source.connect().await.unwrap();
        source
    }

    #[test]
    fn test_calibration_epochs_and_features() {
        let calibration = calibrate();
        // 1280 samples, 256-sample epochs, 77-sample shift
        assert_eq!(calibration.features0.shape(), &[14, 16]);
        assert_eq!(calibration.features1.shape(), &[14, 16]);
        assert_eq!(calibration.classifier.n_features(), 16);
    }

    #[test]
    fn test_calibration_needs_a_full_epoch() {
        let short = synthetic(10.0, 0.5);
        let data1 = synthetic(20.0, 5.0);
        assert!(matches!(
            Calibration::fit(short.view(), data1.view(), &config(), FS),
            Err(StreamError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_session_runs_until_source_is_exhausted() {
        let calibration = calibrate();
        let source = connected_replay(synthetic(20.0, 3.0)).await;
        let mut session = OnlineSession::new(source, config(), calibration.classifier).unwrap();

        let summary = session.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.samples_received, 768);
        assert_eq!(summary.iterations, 10);
        assert_eq!(summary.class_counts[0] + summary.class_counts[1], 10);
        assert_eq!(summary.recent_decisions.len(), 5);
        assert_eq!(*summary.recent_decisions.last().unwrap(), 1);
        assert!(!session.source().is_connected());

        let snapshot = session.buffer_snapshot();
        assert_eq!(snapshot.nrows(), 1024);
        let expected = synthetic(20.0, 3.0);
        assert_eq!(snapshot.slice(s![256.., ..]), expected.view());
    }

    #[tokio::test]
    async fn test_decisions_follow_the_mental_state() {
        let calibration = calibrate();
        let source = connected_replay(synthetic(10.0, 3.0)).await;
        let mut session = OnlineSession::new(source, config(), calibration.classifier).unwrap();

        let decisions = session.decisions();
        for _ in 0..8 {
            session.step().await.unwrap();
        }
        // Once the window holds only recorded samples the decision is stable
        assert_eq!(decisions.latest(), Some(0));
        assert_eq!(session.iterations(), 8);
    }

    #[tokio::test]
    async fn test_notch_state_is_threaded() {
        let calibration = calibrate();
        let source = connected_replay(synthetic(20.0, 2.0)).await;
        let notched = PipelineConfig {
            notch_enabled: true,
            ..config()
        };
        let mut session = OnlineSession::new(source, notched, calibration.classifier).unwrap();

        assert!(session.filter_state().is_none());
        session.step().await.unwrap();
        let first = session.filter_state().cloned().unwrap();
        assert_eq!(first.num_channels(), 5);

        session.step().await.unwrap();
        assert_ne!(session.filter_state().unwrap(), &first);
    }

    #[tokio::test]
    async fn test_updates_are_published() {
        let calibration = calibrate();
        let source = connected_replay(synthetic(20.0, 2.0)).await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut session = OnlineSession::new(source, config(), calibration.classifier)
            .unwrap()
            .with_updates(tx);

        session.step().await.unwrap();
        session.step().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.iteration, 1);
        assert_eq!(second.iteration, 2);
        assert_eq!(second.features.len(), 16);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_source() {
        let calibration = calibrate();
        let mut source = ReplaySource::new(params(), synthetic(20.0, 2.0))
            .with_looping(true)
            .with_rate_limit(Some(5));
        source.connect().await.unwrap();
        let mut session = OnlineSession::new(source, config(), calibration.classifier).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let summary = session.run(cancel).await.unwrap();
        assert!(summary.iterations > 0);
        assert!(!session.source().is_connected());
    }

    #[tokio::test]
    async fn test_classifier_must_match_channel_layout() {
        let calibration = calibrate();
        let source = connected_replay(synthetic(20.0, 2.0)).await;
        let keep_status = PipelineConfig {
            drop_status_column: false,
            ..config()
        };
        assert!(matches!(
            OnlineSession::new(source, keep_status, calibration.classifier),
            Err(StreamError::ShapeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_requires_connected_source() {
        let calibration = calibrate();
        let source = ReplaySource::new(params(), synthetic(20.0, 2.0));
        assert!(matches!(
            OnlineSession::new(source, config(), calibration.classifier),
            Err(StreamError::Connection(_))
        ));
    }
}
