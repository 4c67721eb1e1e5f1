//! Digital Filter Implementations
//!
//! IIR filters as cascaded second-order sections (biquads, Direct Form II
//! Transposed). Coefficients are immutable and shared; the per-channel state is
//! a separate caller-owned [`FilterState`] so a stream can be filtered in
//! consecutive blocks without transients at the block boundaries.

use crate::error::{StreamError, StreamResult};
use ndarray::{Array2, ArrayView2};
use rustfft::num_complex::Complex;
use std::f64::consts::PI;
use std::sync::OnceLock;

/// Band edges of the mains-interference notch (Hz)
pub const MAINS_NOTCH_BAND: (f64, f64) = (55.0, 65.0);

/// Sampling rate the mains notch is designed for (Hz)
pub const MAINS_NOTCH_FS: f64 = 256.0;

/// Butterworth order of the mains notch prototype
pub const MAINS_NOTCH_ORDER: usize = 4;

/// Second-order section (biquad) coefficients
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Gain at DC (z = 1)
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// State reached after an infinitely long constant input of `input`
    fn steady_state(&self, input: f64) -> [f64; 2] {
        let output = self.dc_gain() * input;
        let z2 = self.b2 * input - self.a2 * output;
        let z1 = self.b1 * input - self.a1 * output + z2;
        [z1, z2]
    }

    #[inline]
    fn process(&self, input: f64, state: &mut [f64; 2]) -> f64 {
        let output = self.b0 * input + state[0];
        state[0] = self.b1 * input - self.a1 * output + state[1];
        state[1] = self.b2 * input - self.a2 * output;
        output
    }
}

/// Cascaded second-order sections
#[derive(Debug, Clone, PartialEq)]
pub struct SosCoefficients {
    sections: Vec<BiquadCoeffs>,
}

impl SosCoefficients {
    pub fn new(sections: Vec<BiquadCoeffs>) -> Self {
        Self { sections }
    }

    pub fn sections(&self) -> &[BiquadCoeffs] {
        &self.sections
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    /// Magnitude response at `freq` Hz for sampling rate `sample_rate`
    pub fn magnitude_at(&self, freq: f64, sample_rate: f64) -> f64 {
        let w = 2.0 * PI * freq / sample_rate;
        let z1 = Complex::from_polar(1.0, -w);
        let z2 = z1 * z1;
        self.sections
            .iter()
            .map(|s| {
                let num = s.b0 + z1 * s.b1 + z2 * s.b2;
                let den = 1.0 + z1 * s.a1 + z2 * s.a2;
                (num / den).norm()
            })
            .product()
    }

    /// Per-section state for a unit step input held forever
    pub fn steady_state(&self) -> Vec<[f64; 2]> {
        let mut input = 1.0;
        self.sections
            .iter()
            .map(|section| {
                let zi = section.steady_state(input);
                input *= section.dc_gain();
                zi
            })
            .collect()
    }

    /// Filter a block of rows `[n_samples, n_channels]` along the time axis,
    /// advancing `state` so the next block continues seamlessly
    pub fn filter_rows(
        &self,
        rows: ArrayView2<f64>,
        state: &mut FilterState,
    ) -> StreamResult<Array2<f64>> {
        state.check(self, rows.ncols())?;

        let mut output = rows.to_owned();
        for (channel, mut column) in output.columns_mut().into_iter().enumerate() {
            let channel_state = &mut state.channels[channel];
            for sample in column.iter_mut() {
                let mut value = *sample;
                for (section, zi) in self.sections.iter().zip(channel_state.iter_mut()) {
                    value = section.process(value, zi);
                }
                *sample = value;
            }
        }

        Ok(output)
    }
}

/// Butterworth band-stop designer
pub struct ButterworthBandstop;

impl ButterworthBandstop {
    /// Design a band-stop filter rejecting `[low, high]` Hz
    ///
    /// The analog Butterworth prototype of `order` is mapped to a band-stop,
    /// then to the z-plane with the bilinear transform (prewarped edges).
    /// Each resulting conjugate pole pair becomes one biquad normalized to unit
    /// DC gain, giving `order` sections in total.
    pub fn design(
        low: f64,
        high: f64,
        sample_rate: f64,
        order: usize,
    ) -> StreamResult<SosCoefficients> {
        let nyquist = sample_rate / 2.0;
        if order == 0 || order % 2 != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "Band-stop order must be even and positive, got {}",
                order
            )));
        }
        if !(0.0 < low && low < high && high < nyquist) {
            return Err(StreamError::InvalidConfig(format!(
                "Band-stop edges must satisfy 0 < {} < {} < {} (Nyquist)",
                low, high, nyquist
            )));
        }

        Ok(Self::sections(low, high, sample_rate, order))
    }

    fn sections(low: f64, high: f64, sample_rate: f64, order: usize) -> SosCoefficients {
        let w_low = Self::prewarp(low, sample_rate);
        let w_high = Self::prewarp(high, sample_rate);
        let w0 = (w_low * w_high).sqrt();
        let bandwidth = w_high - w_low;

        // Zeros at +-j*w0 land on the unit circle at the notch centre
        let zero = Self::bilinear(Complex::new(0.0, w0));
        let (b1, b2) = (-2.0 * zero.re, zero.norm_sqr());

        let mut sections = Vec::with_capacity(order);
        for k in 0..order {
            let prototype = Complex::from_polar(
                1.0,
                PI * (2 * k + order + 1) as f64 / (2 * order) as f64,
            );
            // Conjugate prototype poles yield the conjugates of these poles
            if prototype.im <= 0.0 {
                continue;
            }

            let half = bandwidth / 2.0 / prototype;
            let disc = (half * half - w0 * w0).sqrt();
            for pole in [half + disc, half - disc] {
                let p = Self::bilinear(pole);
                let a1 = -2.0 * p.re;
                let a2 = p.norm_sqr();
                let gain = (1.0 + a1 + a2) / (1.0 + b1 + b2);
                sections.push(BiquadCoeffs {
                    b0: gain,
                    b1: b1 * gain,
                    b2: b2 * gain,
                    a1,
                    a2,
                });
            }
        }

        SosCoefficients::new(sections)
    }

    /// Prewarp a frequency for the bilinear transform (sampling period 1/2)
    fn prewarp(freq: f64, sample_rate: f64) -> f64 {
        4.0 * (PI * freq / sample_rate).tan()
    }

    fn bilinear(s: Complex<f64>) -> Complex<f64> {
        (4.0 + s) / (4.0 - s)
    }
}

/// The process-wide mains notch: 4th-order Butterworth band-stop, 55-65 Hz at 256 Hz
pub fn mains_notch() -> &'static SosCoefficients {
    static NOTCH: OnceLock<SosCoefficients> = OnceLock::new();
    NOTCH.get_or_init(|| {
        let (low, high) = MAINS_NOTCH_BAND;
        ButterworthBandstop::sections(low, high, MAINS_NOTCH_FS, MAINS_NOTCH_ORDER)
    })
}

/// Recursive filter state, one `[z1, z2]` pair per section per channel
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    channels: Vec<Vec<[f64; 2]>>,
}

impl FilterState {
    /// All-zero state (the filter starts from rest)
    pub fn zeros(coeffs: &SosCoefficients, n_channels: usize) -> Self {
        Self {
            channels: vec![vec![[0.0; 2]; coeffs.num_sections()]; n_channels],
        }
    }

    /// Unit-step steady state, the same for every channel
    ///
    /// A signal sitting at 1.0 passes through a filter started from this state
    /// without a start-up transient.
    pub fn steady_state(coeffs: &SosCoefficients, n_channels: usize) -> Self {
        Self {
            channels: vec![coeffs.steady_state(); n_channels],
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn check(&self, coeffs: &SosCoefficients, n_channels: usize) -> StreamResult<()> {
        if self.channels.len() != n_channels {
            return Err(StreamError::shape(
                format!("filter state for {} channels", n_channels),
                format!("{} channels", self.channels.len()),
            ));
        }
        if self
            .channels
            .iter()
            .any(|sections| sections.len() != coeffs.num_sections())
        {
            return Err(StreamError::shape(
                format!("{} sections", coeffs.num_sections()),
                "a state from a different filter",
            ));
        }
        Ok(())
    }
}
