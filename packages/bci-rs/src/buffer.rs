// Fixed-size sliding buffers for streaming samples and classifier decisions
//
// StreamBuffer always holds exactly `capacity` rows; appending k rows evicts the
// k oldest. DecisionBuffer is a small shared ring read by consumers (display,
// messaging) and written only by the acquisition loop.

use crate::error::{StreamError, StreamResult};
use crate::filters::{FilterState, SosCoefficients};
use crate::types::Decision;
use ndarray::{s, Array2, ArrayView2};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ring buffer of multichannel samples `[capacity, n_channels]`, newest rows last
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBuffer {
    data: Array2<f64>,
}

impl StreamBuffer {
    pub fn new(capacity: usize, n_channels: usize) -> Self {
        Self::zeros(capacity, n_channels)
    }

    /// Buffer of `capacity` zero rows
    pub fn zeros(capacity: usize, n_channels: usize) -> Self {
        Self {
            data: Array2::zeros((capacity, n_channels)),
        }
    }

    /// Wrap an existing matrix; its row count becomes the fixed capacity
    pub fn from_array(data: Array2<f64>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn n_channels(&self) -> usize {
        self.data.ncols()
    }

    pub fn view(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    /// Owned copy of the current contents for consumers
    pub fn snapshot(&self) -> Array2<f64> {
        self.data.clone()
    }

    /// Append rows and evict the same number of oldest rows
    pub fn append(&mut self, rows: ArrayView2<f64>) -> StreamResult<()> {
        self.check_columns(rows.ncols())?;

        let capacity = self.len();
        let incoming = rows.nrows();

        if incoming >= capacity {
            // Only the newest `capacity` rows of old ++ new survive
            self.data
                .assign(&rows.slice(s![incoming - capacity.., ..]));
        } else if incoming > 0 {
            let kept = self.data.slice(s![incoming.., ..]).to_owned();
            self.data.slice_mut(s![..capacity - incoming, ..]).assign(&kept);
            self.data.slice_mut(s![capacity - incoming.., ..]).assign(&rows);
        }

        Ok(())
    }

    /// Notch-filter `rows` and append them, threading the filter state
    ///
    /// A missing state is initialized from the filter's unit-step steady state on
    /// every channel. The returned state must be passed to the
    /// next call to keep the filtered signal continuous.
    pub fn append_notched(
        &mut self,
        rows: ArrayView2<f64>,
        filter: &SosCoefficients,
        state: Option<FilterState>,
    ) -> StreamResult<FilterState> {
        self.check_columns(rows.ncols())?;

        let mut state = state.unwrap_or_else(|| FilterState::steady_state(filter, rows.ncols()));

        let filtered = filter.filter_rows(rows, &mut state)?;
        self.append(filtered.view())?;

        Ok(state)
    }

    /// The newest `count` rows
    pub fn tail(&self, count: usize) -> StreamResult<ArrayView2<f64>> {
        if count > self.len() {
            return Err(StreamError::InvalidInput(format!(
                "Requested {} rows from a buffer of {}",
                count,
                self.len()
            )));
        }
        Ok(self.data.slice(s![self.len() - count.., ..]))
    }

    fn check_columns(&self, n_columns: usize) -> StreamResult<()> {
        if n_columns != self.n_channels() {
            return Err(StreamError::shape(
                format!("{} columns", self.n_channels()),
                format!("{} columns", n_columns),
            ));
        }
        Ok(())
    }
}

/// Shared ring of the most recent classifier decisions
///
/// Clones share the same storage, so a consumer task can hold a handle while
/// the acquisition loop pushes.
#[derive(Debug, Clone)]
pub struct DecisionBuffer {
    decisions: Arc<RwLock<VecDeque<Decision>>>,
    capacity: usize,
}

impl DecisionBuffer {
    /// Buffer pre-filled with `capacity` zero decisions
    pub fn new(capacity: usize) -> Self {
        Self {
            decisions: Arc::new(RwLock::new(std::iter::repeat(0).take(capacity).collect())),
            capacity,
        }
    }

    pub fn push(&self, decision: Decision) {
        if self.capacity == 0 {
            return;
        }
        let mut decisions = self.decisions.write();
        if decisions.len() == self.capacity {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }

    /// Decisions oldest to newest
    pub fn snapshot(&self) -> Vec<Decision> {
        self.decisions.read().iter().copied().collect()
    }

    pub fn latest(&self) -> Option<Decision> {
        self.decisions.read().back().copied()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
