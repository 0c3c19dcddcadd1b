//! Objective function measuring how far assigned volumes are from the observed counts.
//!
//! The value is the sum of two terms:
//!
//! 1. `Σ |observed - assigned|^p1 / p1` over every count observation, and
//! 2. `Σ |initial - current|^p2 / p2` over every demand cell of every class,
//!    present only when `p2 != 0`.
//!
//! The second term is a regularization penalty discouraging drift away from the
//! prior demand estimate.

use crate::data::{ClassDemand, CountSet};
use crate::error::{OdmeError, Result};
use crate::options::ObjectiveExponents;

/// Validated objective function with exponents `(p1, p2)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectiveFunction {
    p1: f64,
    p2: f64,
}

impl ObjectiveFunction {
    /// Builds an objective; `p1` must be positive, `p2` positive or the `0` sentinel.
    pub fn new(p1: f64, p2: f64) -> Result<Self> {
        if !p1.is_finite() || p1 <= 0.0 {
            return Err(OdmeError::InvalidExponent {
                name: "p1",
                requirement: "finite and positive",
                value: p1,
            });
        }
        if !p2.is_finite() || p2 < 0.0 {
            return Err(OdmeError::InvalidExponent {
                name: "p2",
                requirement: "finite and positive, or 0 to disable regularization",
                value: p2,
            });
        }
        Ok(Self { p1, p2 })
    }

    /// Exponent of the count-error term.
    pub fn p1(&self) -> f64 {
        self.p1
    }

    /// Exponent of the regularization term (`0` when disabled).
    pub fn p2(&self) -> f64 {
        self.p2
    }

    /// Returns `true` when the regularization term contributes to the value.
    pub fn is_regularized(&self) -> bool {
        self.p2 != 0.0
    }

    /// Derivative of one count's error term with respect to its assigned volume.
    ///
    /// `error` is `assigned - observed`; the result is `sign(error) |error|^(p1 - 1)`,
    /// and exactly `0` for a matched count.
    pub fn count_derivative(&self, error: f64) -> f64 {
        if error == 0.0 {
            return 0.0;
        }
        error.signum() * error.abs().powf(self.p1 - 1.0)
    }

    /// Count-error term alone.
    pub fn count_term(&self, observations: &CountSet) -> f64 {
        observations
            .iter()
            .map(|obs| (obs.observed() - obs.assigned()).abs().powf(self.p1))
            .sum::<f64>()
            / self.p1
    }

    /// Regularization term alone; `0` when disabled.
    pub fn regularization_term(&self, classes: &[ClassDemand]) -> f64 {
        if !self.is_regularized() {
            return 0.0;
        }
        classes
            .iter()
            .map(|class| {
                class
                    .initial()
                    .iter()
                    .zip(class.current().iter())
                    .map(|(initial, current)| (initial - current).abs().powf(self.p2))
                    .sum::<f64>()
            })
            .sum::<f64>()
            / self.p2
    }

    /// Full objective value.
    pub fn evaluate(&self, observations: &CountSet, classes: &[ClassDemand]) -> f64 {
        self.count_term(observations) + self.regularization_term(classes)
    }
}

impl TryFrom<ObjectiveExponents> for ObjectiveFunction {
    type Error = OdmeError;

    fn try_from(exponents: ObjectiveExponents) -> Result<Self> {
        Self::new(exponents.p1, exponents.p2)
    }
}
