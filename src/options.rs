//! Configuration structures for the calibration loop, objective and scaling algorithms.

use crate::error::{OdmeError, Result};

/// Iteration caps and convergence thresholds of the two-level loop.
#[derive(Clone, Debug, PartialEq)]
pub struct StopCriteria {
    /// Maximum number of outer iterations (full re-assignments after the cold start).
    pub max_outer: usize,
    /// Maximum number of inner iterations per outer iteration.
    pub max_inner: usize,
    /// Outer loop stops once the objective is at or below this value.
    pub outer_tolerance: f64,
    /// Inner loop stops once the objective changes by at most this value.
    pub inner_tolerance: f64,
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self {
            max_outer: 50,
            max_inner: 50,
            outer_tolerance: 1e-4,
            inner_tolerance: 1e-4,
        }
    }
}

impl StopCriteria {
    /// Creates stop criteria from `(max_outer, max_inner, outer_tolerance, inner_tolerance)`.
    pub fn new(max_outer: usize, max_inner: usize, outer_tolerance: f64, inner_tolerance: f64) -> Self {
        Self {
            max_outer,
            max_inner,
            outer_tolerance,
            inner_tolerance,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("outer_tolerance", self.outer_tolerance),
            ("inner_tolerance", self.inner_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(OdmeError::invalid_option(
                    name,
                    format!("must be finite and nonnegative, found {value}"),
                ));
            }
        }
        Ok(())
    }
}

/// Exponents of the objective function; `p2 = 0` disables regularization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectiveExponents {
    /// Exponent of the count-error term.
    pub p1: f64,
    /// Exponent of the demand-drift term.
    pub p2: f64,
}

impl Default for ObjectiveExponents {
    fn default() -> Self {
        Self { p1: 2.0, p2: 0.0 }
    }
}

/// Tuning of the geometric-mean balancing algorithm.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometricMeanOptions {
    /// Lower bound applied to every `observed / assigned` ratio.
    pub floor: f64,
}

impl Default for GeometricMeanOptions {
    fn default() -> Self {
        Self { floor: 0.01 }
    }
}

/// Tuning of the gradient-based (Spiess) algorithm.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpiessOptions {
    /// Optional bound on the absolute step length, applied after the nonnegativity bounds.
    pub max_step: Option<f64>,
}

/// Aggregated configuration of an [`Odme`](crate::Odme) run.
#[derive(Clone, Debug, PartialEq)]
pub struct OdmeOptions {
    pub stop: StopCriteria,
    pub objective: ObjectiveExponents,
    /// Name of the scaling algorithm (`"gmean"` or `"spiess"`).
    pub algorithm: String,
    pub geometric_mean: GeometricMeanOptions,
    pub spiess: SpiessOptions,
}

impl Default for OdmeOptions {
    fn default() -> Self {
        Self {
            stop: StopCriteria::default(),
            objective: ObjectiveExponents::default(),
            algorithm: "gmean".to_string(),
            geometric_mean: GeometricMeanOptions::default(),
            spiess: SpiessOptions::default(),
        }
    }
}

impl OdmeOptions {
    /// Override the stop criteria while preserving other defaults.
    pub fn with_stop_criteria(mut self, stop: StopCriteria) -> Self {
        self.stop = stop;
        self
    }

    /// Set the objective exponents `(p1, p2)`.
    pub fn with_objective(mut self, p1: f64, p2: f64) -> Self {
        self.objective = ObjectiveExponents { p1, p2 };
        self
    }

    /// Select the scaling algorithm by name. Validated when the controller is built.
    pub fn with_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    /// Set the ratio floor of the geometric-mean algorithm.
    pub fn with_gmean_floor(mut self, floor: f64) -> Self {
        self.geometric_mean.floor = floor;
        self
    }

    /// Bound the absolute Spiess step length.
    pub fn with_spiess_max_step(mut self, max_step: f64) -> Self {
        self.spiess.max_step = Some(max_step);
        self
    }
}
