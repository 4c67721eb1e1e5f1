//! Spectral band-power features.
//!
//! Each epoch is reduced to the mean amplitude spectrum of four EEG bands per
//! channel. The pipeline per channel is:
//!
//! 1. remove the channel mean
//! 2. apply a symmetric Hamming window
//! 3. zero-pad to the next power of two and FFT
//! 4. take `2 * |Y| / N` over the first `NFFT / 2` bins
//! 5. average the bins of each band and take `log10`
//!
//! The frequency assigned to bin `k` is `fs / 2 * k / (NFFT / 2 - 1)`, i.e. the
//! half spectrum is stretched over `[0, fs / 2]`. Band membership is decided on
//! that axis.
//!
//! Features are laid out band-major: all delta powers, then theta, alpha, beta.

use crate::error::{StreamError, StreamResult};
use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use std::cell::RefCell;
use std::f64::consts::PI;

thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

/// Band powers below this are clamped before taking the logarithm
pub const MIN_BAND_POWER: f64 = 1e-12;

pub const BAND_NAMES: [&str; 4] = ["delta", "theta", "alpha", "beta"];

/// Frequency bands, in feature order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// f < 4 Hz
    Delta,
    /// 4 <= f <= 8 Hz
    Theta,
    /// 8 <= f <= 12 Hz
    Alpha,
    /// 12 <= f < 30 Hz
    Beta,
}

impl Band {
    pub const ALL: [Band; 4] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta];

    pub fn contains(&self, freq: f64) -> bool {
        match self {
            Band::Delta => freq < 4.0,
            Band::Theta => (4.0..=8.0).contains(&freq),
            Band::Alpha => (8.0..=12.0).contains(&freq),
            Band::Beta => (12.0..30.0).contains(&freq),
        }
    }

    pub fn name(&self) -> &'static str {
        BAND_NAMES[*self as usize]
    }
}

/// Smallest power of two >= n (1 for n <= 1)
pub fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Symmetric Hamming window of length n
pub fn hamming(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / denom).cos())
        .collect()
}

/// Frequency axis of the half spectrum: `fs / 2 * linspace(0, 1, n_bins)`
pub fn frequency_axis(fs: f64, n_bins: usize) -> Vec<f64> {
    match n_bins {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let step = (fs / 2.0) / (n_bins - 1) as f64;
            (0..n_bins).map(|k| k as f64 * step).collect()
        }
    }
}

/// Converts epochs into band-power feature vectors
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    fs: f64,
    status_column: Option<usize>,
}

impl FeatureExtractor {
    pub fn new(fs: f64) -> Self {
        Self {
            fs,
            status_column: None,
        }
    }

    /// Skip column `index` (status/trigger channel) in every epoch
    pub fn with_status_column(mut self, index: usize) -> Self {
        self.status_column = Some(index);
        self
    }

    pub fn fs(&self) -> f64 {
        self.fs
    }

    pub fn status_column(&self) -> Option<usize> {
        self.status_column
    }

    /// Number of EEG channels left after the status column is removed
    pub fn active_channels(&self, n_columns: usize) -> StreamResult<usize> {
        match self.status_column {
            Some(index) if index >= n_columns => Err(StreamError::shape(
                format!("status column {} within the epoch", index),
                format!("{} columns", n_columns),
            )),
            Some(_) => Ok(n_columns - 1),
            None => Ok(n_columns),
        }
    }

    pub fn n_features(&self, n_columns: usize) -> StreamResult<usize> {
        Ok(Band::ALL.len() * self.active_channels(n_columns)?)
    }

    /// Feature labels in feature order, e.g. `pwr-alpha-AF7`
    pub fn feature_names(&self, channel_names: &[String]) -> Vec<String> {
        let active: Vec<&String> = channel_names
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.status_column)
            .map(|(_, name)| name)
            .collect();

        Band::ALL
            .iter()
            .flat_map(|band| {
                active
                    .iter()
                    .map(move |name| format!("pwr-{}-{}", band.name(), name))
            })
            .collect()
    }

    /// Mean amplitude per band and channel, band-major, before the logarithm
    pub fn band_powers(&self, epoch: ArrayView2<f64>) -> StreamResult<Array1<f64>> {
        let n_channels = self.active_channels(epoch.ncols())?;
        let n_samples = epoch.nrows();
        if n_channels == 0 {
            return Err(StreamError::InvalidInput(
                "Epoch has no EEG channels".to_string(),
            ));
        }
        if n_samples == 0 {
            return Err(StreamError::InvalidInput("Epoch has no samples".to_string()));
        }

        let nfft = next_pow2(n_samples);
        let n_bins = nfft / 2;
        let freqs = frequency_axis(self.fs, n_bins);

        // Bin indices per band, shared by all channels
        let band_bins: Vec<Vec<usize>> = Band::ALL
            .iter()
            .map(|band| {
                freqs
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| band.contains(**f))
                    .map(|(k, _)| k)
                    .collect()
            })
            .collect();

        for (band, bins) in Band::ALL.iter().zip(&band_bins) {
            if bins.is_empty() {
                return Err(StreamError::NumericDegeneracy(format!(
                    "No frequency bins in the {} band ({} samples at {} Hz)",
                    band.name(),
                    n_samples,
                    self.fs
                )));
            }
        }

        let window = hamming(n_samples);
        let fft = FFT_PLANNER.with(|planner| planner.borrow_mut().plan_fft_forward(nfft));

        let mut powers = Array1::zeros(Band::ALL.len() * n_channels);
        let mut buffer = vec![Complex::new(0.0, 0.0); nfft];

        let channels = epoch
            .axis_iter(Axis(1))
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.status_column)
            .map(|(_, column)| column);

        for (ch, column) in channels.enumerate() {
            let mean = column.sum() / n_samples as f64;

            buffer.fill(Complex::new(0.0, 0.0));
            for ((slot, &x), &w) in buffer.iter_mut().zip(column.iter()).zip(&window) {
                *slot = Complex::new((x - mean) * w, 0.0);
            }

            fft.process(&mut buffer);

            let spectrum: Vec<f64> = buffer[..n_bins]
                .iter()
                .map(|c| 2.0 * c.norm() / n_samples as f64)
                .collect();

            for (b, bins) in band_bins.iter().enumerate() {
                let total: f64 = bins.iter().map(|&k| spectrum[k]).sum();
                powers[b * n_channels + ch] = total / bins.len() as f64;
            }
        }

        Ok(powers)
    }

    /// log10 band powers of one `[samples, columns]` epoch
    pub fn compute_feature_vector(&self, epoch: ArrayView2<f64>) -> StreamResult<Array1<f64>> {
        let powers = self.band_powers(epoch)?;
        Ok(powers.mapv(|p| p.max(MIN_BAND_POWER).log10()))
    }

    /// Feature matrix `[n_epochs, n_features]` for epochs stacked on the last axis
    pub fn compute_feature_matrix(&self, epochs: ArrayView3<f64>) -> StreamResult<Array2<f64>> {
        let n_features = self.n_features(epochs.shape()[1])?;
        let views: Vec<ArrayView2<f64>> = epochs.axis_iter(Axis(2)).collect();

        let rows = views
            .par_iter()
            .map(|epoch| self.compute_feature_vector(epoch.view()))
            .collect::<StreamResult<Vec<_>>>()?;

        let mut matrix = Array2::zeros((rows.len(), n_features));
        for (mut target, row) in matrix.axis_iter_mut(Axis(0)).zip(&rows) {
            target.assign(row);
        }

        log::debug!(
            "Computed {} feature vectors of {} features",
            rows.len(),
            n_features
        );

        Ok(matrix)
    }
}
