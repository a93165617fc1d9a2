//! Streaming aggregation of per-frame detection statistics
//!
//! Two running values are derived from the `Stats` stream:
//! - a cumulative delta that adds `|count - previous_count|` on every sample,
//!   which measures count churn rather than unique potholes
//! - a windowed mean severity that restarts whenever the reported count
//!   differs from the previous sample's count
//!
//! The reset trigger is exact count equality between consecutive samples,
//! not a time window.

use super::protocol::Stats;

/// Aggregate statistics of one detection session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateState {
    /// Count of the previous sample, `None` before the first one
    pub previous_count: Option<u32>,

    pub severity_sum: f64,
    pub severity_sample_count: u32,
    pub current_average_severity: f64,

    /// Sum of `|count_i - count_{i-1}|` over consecutive samples
    pub cumulative_pothole_delta: u64,

    /// Most recent per-frame values as reported by the backend
    pub last_count: Option<u32>,
    pub last_severity: Option<f64>,
}

/// Owner of [`AggregateState`]; the only place it is mutated
#[derive(Debug, Default)]
pub struct ResultAggregator {
    state: AggregateState,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one `Stats` sample into the aggregate
    pub fn apply(&mut self, stats: Stats) -> AggregateState {
        let Stats {
            pothole_count: count,
            average_severity: severity,
        } = stats;
        let state = &mut self.state;

        if let Some(previous) = state.previous_count {
            state.cumulative_pothole_delta += u64::from(count.abs_diff(previous));
        }

        if state.previous_count == Some(count) {
            state.severity_sum += severity;
            state.severity_sample_count += 1;
            state.current_average_severity =
                state.severity_sum / f64::from(state.severity_sample_count);
        } else {
            state.severity_sum = severity;
            state.severity_sample_count = 1;
            state.current_average_severity = severity;
        }

        state.previous_count = Some(count);
        state.last_count = Some(count);
        state.last_severity = Some(severity);

        *state
    }

    /// Read-only copy of the current aggregate
    pub fn snapshot(&self) -> AggregateState {
        self.state
    }

    /// Back to the zero state of a fresh session
    pub fn reset(&mut self) {
        self.state = AggregateState::default();
    }
}
