//! Append-only diagnostics recorded during calibration.

use std::time::Instant;

use nalgebra::DMatrix;
use serde::Serialize;

use crate::convergence::{ConvergenceState, IterationState};
use crate::data::{ClassDemand, CountSet, Direction, LinkId};

/// Append-only sequence of records, materialized once on read.
#[derive(Clone, Debug)]
pub struct AppendLog<T> {
    entries: Vec<T>,
}

impl<T> Default for AppendLog<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> AppendLog<T> {
    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn as_slice(&self) -> &[T] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    /// Concatenates the rows produced by every entry into one table.
    pub fn materialize<'a, R, F, I>(&'a self, rows: F) -> Vec<R>
    where
        F: FnMut(&'a T) -> I,
        I: IntoIterator<Item = R>,
    {
        self.entries.iter().flat_map(rows).collect()
    }
}

/// Descriptive statistics of a matrix's cells (population variance and deviation).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DescriptiveStatistics {
    pub mean: f64,
    pub median: f64,
    pub std_deviation: f64,
    pub variance: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl DescriptiveStatistics {
    /// Summarizes every cell of `matrix`. An empty matrix yields NaN moments and a zero sum.
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Self::from_values(matrix.iter().copied().collect())
    }

    fn from_values(mut values: Vec<f64>) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                mean: f64::NAN,
                median: f64::NAN,
                std_deviation: f64::NAN,
                variance: f64::NAN,
                sum: 0.0,
                min: f64::NAN,
                max: f64::NAN,
                count,
            };
        }

        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        values.sort_by(f64::total_cmp);
        let mid = count / 2;
        let median = if count % 2 == 0 {
            0.5 * (values[mid - 1] + values[mid])
        } else {
            values[mid]
        };

        Self {
            mean,
            median,
            std_deviation: variance.sqrt(),
            variance,
            sum,
            min: values[0],
            max: values[count - 1],
            count,
        }
    }
}

/// State of one count observation at a logged iteration.
#[derive(Clone, Debug, Serialize)]
pub struct ObservationRow {
    pub class: String,
    pub link_id: LinkId,
    pub direction: Direction,
    pub observed: f64,
    pub assigned: f64,
    /// `assigned - observed`.
    pub error: f64,
}

/// Everything recorded at one logged iteration.
#[derive(Clone, Debug, Serialize)]
pub struct IterationSnapshot {
    pub outer: usize,
    pub inner: usize,
    pub total_iteration: usize,
    /// Seconds since the previous snapshot (or since the run started).
    pub loop_seconds: f64,
    /// Seconds since the run started.
    pub total_seconds: f64,
    pub convergence: Option<f64>,
    pub inner_convergence: f64,
    pub observations: Vec<ObservationRow>,
}

/// Flattened per-observation statistics row.
#[derive(Clone, Debug, Serialize)]
pub struct StatisticsRow {
    pub outer: usize,
    pub inner: usize,
    pub total_iteration: usize,
    pub total_seconds: f64,
    pub loop_seconds: f64,
    pub convergence: Option<f64>,
    pub inner_convergence: f64,
    pub class: String,
    pub link_id: LinkId,
    pub direction: Direction,
    pub observed: f64,
    pub assigned: f64,
    pub error: f64,
}

/// Statistics of one class's scaling factors at one inner iteration.
#[derive(Clone, Debug, Serialize)]
pub struct FactorRecord {
    pub class: String,
    pub outer: usize,
    pub inner: usize,
    pub total_inner: usize,
    #[serde(flatten)]
    pub statistics: DescriptiveStatistics,
}

/// Ratio of final to initial demand for a class; `1` where the ratio is undefined.
#[derive(Clone, Debug, Serialize)]
pub struct CumulativeFactors {
    pub class: String,
    pub factors: DMatrix<f64>,
}

/// Descriptive statistics of a class's cumulative factors.
#[derive(Clone, Debug, Serialize)]
pub struct CumulativeFactorStatistics {
    pub class: String,
    #[serde(flatten)]
    pub statistics: DescriptiveStatistics,
}

/// Elementwise `current / initial`, with cells of zero initial demand mapped to exactly `1`.
pub fn cumulative_factors(class: &ClassDemand) -> CumulativeFactors {
    let factors = class.current().zip_map(class.initial(), |current, initial| {
        if initial == 0.0 {
            return 1.0;
        }
        let ratio = current / initial;
        if ratio.is_nan() {
            1.0
        } else {
            ratio
        }
    });
    CumulativeFactors {
        class: class.name().to_string(),
        factors,
    }
}

/// Snapshot and factor logs plus the clock that times them.
#[derive(Debug)]
pub struct DiagnosticsLog {
    snapshots: AppendLog<IterationSnapshot>,
    factors: AppendLog<FactorRecord>,
    started: Instant,
    last_tick: Instant,
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            snapshots: AppendLog::default(),
            factors: AppendLog::default(),
            started: now,
            last_tick: now,
        }
    }
}

impl DiagnosticsLog {
    /// Restarts the clock; the next snapshot measures from here.
    pub fn start_clock(&mut self) {
        let now = Instant::now();
        self.started = now;
        self.last_tick = now;
    }

    /// Seconds since the clock was started.
    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Records the state of every observation at the current iteration.
    pub fn log_iteration(
        &mut self,
        iteration: &IterationState,
        convergence: &ConvergenceState,
        observations: &CountSet,
        classes: &[ClassDemand],
    ) {
        let now = Instant::now();
        let loop_seconds = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let rows = observations
            .iter()
            .map(|obs| ObservationRow {
                class: classes[obs.class_index()].name().to_string(),
                link_id: obs.key().link_id,
                direction: obs.key().direction,
                observed: obs.observed(),
                assigned: obs.assigned(),
                error: obs.error(),
            })
            .collect();

        self.snapshots.push(IterationSnapshot {
            outer: iteration.outer,
            inner: iteration.inner,
            total_iteration: iteration.total,
            loop_seconds,
            total_seconds: now.duration_since(self.started).as_secs_f64(),
            convergence: convergence.last(),
            inner_convergence: convergence.delta(),
            observations: rows,
        });
    }

    /// Records descriptive statistics of one set of per-class factors.
    pub fn log_factors(
        &mut self,
        iteration: &IterationState,
        classes: &[ClassDemand],
        factors: &[DMatrix<f64>],
    ) {
        for (class, factor) in classes.iter().zip(factors) {
            self.factors.push(FactorRecord {
                class: class.name().to_string(),
                outer: iteration.outer,
                inner: iteration.inner,
                total_inner: iteration.total_inner,
                statistics: DescriptiveStatistics::from_matrix(factor),
            });
        }
    }

    pub fn snapshots(&self) -> &[IterationSnapshot] {
        self.snapshots.as_slice()
    }

    pub fn factor_records(&self) -> &[FactorRecord] {
        self.factors.as_slice()
    }

    /// All snapshots concatenated into one row per observation per logged iteration.
    pub fn statistics(&self) -> Vec<StatisticsRow> {
        self.snapshots.materialize(|snapshot| {
            snapshot.observations.iter().map(move |row| StatisticsRow {
                outer: snapshot.outer,
                inner: snapshot.inner,
                total_iteration: snapshot.total_iteration,
                total_seconds: snapshot.total_seconds,
                loop_seconds: snapshot.loop_seconds,
                convergence: snapshot.convergence,
                inner_convergence: snapshot.inner_convergence,
                class: row.class.clone(),
                link_id: row.link_id,
                direction: row.direction,
                observed: row.observed,
                assigned: row.assigned,
                error: row.error,
            })
        })
    }
}
