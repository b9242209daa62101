//! Sliding window of request arrival times.

use std::collections::VecDeque;

/// Request timestamps (seconds since the epoch) seen in the last
/// `window_secs`.
#[derive(Debug, Clone)]
pub struct RequestWindow {
    window_secs: f64,
    timestamps: VecDeque<f64>,
}

impl RequestWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs as f64,
            timestamps: VecDeque::new(),
        }
    }

    /// Add a batch of timestamps. Out-of-order batches are tolerated.
    pub fn record(&mut self, timestamps: &[f64]) {
        self.timestamps.extend(timestamps.iter().copied());
        if !is_sorted(&self.timestamps) {
            self.timestamps
                .make_contiguous()
                .sort_by(|a, b| a.total_cmp(b));
        }
    }

    /// Drop timestamps older than the window.
    pub fn trim(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        while self.timestamps.front().is_some_and(|ts| *ts < cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Requests per second over the window ending at `now`.
    pub fn qps(&mut self, now: f64) -> f64 {
        self.trim(now);
        self.timestamps.len() as f64 / self.window_secs
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

fn is_sorted(values: &VecDeque<f64>) -> bool {
    values
        .iter()
        .zip(values.iter().skip(1))
        .all(|(a, b)| a <= b)
}
