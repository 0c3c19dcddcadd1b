//! Iteration counters and convergence bookkeeping for the two-level calibration loop.

use serde::Serialize;

/// Loop counters of the calibration state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IterationState {
    /// Outer iteration number (1-based once the first outer iteration starts).
    pub outer: usize,
    /// Inner iteration number within the current outer iteration.
    pub inner: usize,
    /// Outer plus inner iterations performed so far.
    pub total: usize,
    /// Inner iterations performed across all outer iterations.
    pub total_inner: usize,
    /// Full assignments run, including the cold start.
    pub assignments: usize,
}

impl IterationState {
    pub(crate) fn begin_outer(&mut self) {
        self.outer += 1;
        self.inner = 0;
        self.total += 1;
    }

    pub(crate) fn complete_inner(&mut self) {
        self.inner += 1;
        self.total += 1;
        self.total_inner += 1;
    }

    pub(crate) fn record_assignment(&mut self) {
        self.assignments += 1;
    }

    /// Moves past the last outer iteration so the final snapshot is distinguishable.
    pub(crate) fn finish(&mut self) {
        self.outer += 1;
        self.inner = 0;
    }
}

/// Last objective value and the change between the two most recent evaluations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConvergenceState {
    last: Option<f64>,
    delta: f64,
}

impl Default for ConvergenceState {
    fn default() -> Self {
        Self {
            last: None,
            delta: f64::INFINITY,
        }
    }
}

impl ConvergenceState {
    /// Latest objective value, `None` before the first evaluation.
    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Absolute change between the two most recent values (infinite until two exist).
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Records a new objective value.
    pub fn record(&mut self, value: f64) {
        if let Some(previous) = self.last {
            self.delta = (previous - value).abs();
        }
        self.last = Some(value);
    }

    /// Forces the next inner-loop check to pass.
    pub fn reset_delta(&mut self) {
        self.delta = f64::INFINITY;
    }

    /// Returns `true` while the latest value is still above `tolerance`.
    pub(crate) fn above(&self, tolerance: f64) -> bool {
        self.last.map_or(true, |value| value > tolerance)
    }
}

/// Terminal state of a calibration run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CalibrationStatus {
    /// Objective dropped to the outer tolerance.
    Converged,
    /// Outer iteration cap reached first.
    MaxOuterReached,
}

/// Diagnostics returned by [`Odme::execute`](crate::Odme::execute).
#[derive(Clone, Debug, Serialize)]
pub struct CalibrationSummary {
    pub status: CalibrationStatus,
    /// Counters after the final snapshot.
    pub iterations: IterationState,
    /// Objective value after the last full assignment.
    pub objective: f64,
    /// Wall-clock seconds spent in `execute`.
    pub elapsed_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_infinite_until_two_values_exist() {
        let mut state = ConvergenceState::default();
        assert!(state.last().is_none());
        assert!(state.above(1e9));

        state.record(10.0);
        assert_eq!(state.last(), Some(10.0));
        assert!(state.delta().is_infinite());

        state.record(4.0);
        assert_eq!(state.delta(), 6.0);

        // A zero objective is a valid previous value.
        state.record(0.0);
        state.record(0.5);
        assert_eq!(state.delta(), 0.5);

        state.reset_delta();
        assert!(state.delta().is_infinite());
        assert_eq!(state.last(), Some(0.5));
    }

    #[test]
    fn counters_follow_reset_rules() {
        let mut state = IterationState::default();
        state.begin_outer();
        state.complete_inner();
        state.complete_inner();
        assert_eq!((state.outer, state.inner, state.total, state.total_inner), (1, 2, 3, 2));

        state.begin_outer();
        assert_eq!((state.outer, state.inner, state.total, state.total_inner), (2, 0, 4, 2));

        state.finish();
        assert_eq!((state.outer, state.inner, state.total), (3, 0, 4));
    }
}
