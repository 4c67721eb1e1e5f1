//! Segmentation of a continuous recording into overlapping windows.
//!
//! Epochs are stacked along the last axis: `[samples_per_epoch, n_channels, n_epochs]`.
//! Epoch `i` starts at row `i * (samples_per_epoch - samples_overlap)`. Trailing
//! samples that do not fill a whole epoch are dropped.

use crate::error::{StreamError, StreamResult};
use ndarray::{s, Array3, ArrayView2, Axis};
use std::ops::Range;

fn shift(samples_per_epoch: usize, samples_overlap: usize) -> StreamResult<usize> {
    if samples_per_epoch == 0 {
        return Err(StreamError::InvalidConfig(
            "Epoch length must be at least one sample".to_string(),
        ));
    }
    if samples_overlap >= samples_per_epoch {
        return Err(StreamError::InvalidConfig(format!(
            "Overlap of {} samples leaves no shift for epochs of {} samples",
            samples_overlap, samples_per_epoch
        )));
    }
    Ok(samples_per_epoch - samples_overlap)
}

/// Number of whole epochs that fit in `n_samples`
pub fn epoch_count(
    n_samples: usize,
    samples_per_epoch: usize,
    samples_overlap: usize,
) -> StreamResult<usize> {
    let shift = shift(samples_per_epoch, samples_overlap)?;
    if n_samples < samples_per_epoch {
        return Ok(0);
    }
    Ok((n_samples - samples_per_epoch) / shift + 1)
}

/// Row ranges of every epoch, in order
pub fn epoch_ranges(
    n_samples: usize,
    samples_per_epoch: usize,
    samples_overlap: usize,
) -> StreamResult<Vec<Range<usize>>> {
    let shift = shift(samples_per_epoch, samples_overlap)?;
    let count = epoch_count(n_samples, samples_per_epoch, samples_overlap)?;
    Ok((0..count)
        .map(|i| {
            let start = i * shift;
            start..start + samples_per_epoch
        })
        .collect())
}

/// Split `[n_samples, n_channels]` data into `[samples_per_epoch, n_channels, n_epochs]`
pub fn epoch(
    data: ArrayView2<f64>,
    samples_per_epoch: usize,
    samples_overlap: usize,
) -> StreamResult<Array3<f64>> {
    let ranges = epoch_ranges(data.nrows(), samples_per_epoch, samples_overlap)?;

    let mut epochs = Array3::zeros((samples_per_epoch, data.ncols(), ranges.len()));
    for (i, range) in ranges.into_iter().enumerate() {
        epochs
            .index_axis_mut(Axis(2), i)
            .assign(&data.slice(s![range, ..]));
    }

    Ok(epochs)
}
