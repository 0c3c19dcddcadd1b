//! Scaling-factor algorithms proposing per-class demand multipliers.
//!
//! Every algorithm sees the same read-only [`CalibrationState`] and must return
//! one nonnegative matrix per class, shaped like that class's demand. The
//! controller multiplies the current demand by these factors elementwise.
//!
//! Two algorithms are available:
//!
//! - [`GeometricMean`] balances each OD cell by the geometric mean of the
//!   `observed / assigned` ratios of the counts whose select link it uses.
//! - [`Spiess`] takes a single gradient step on the count-error term of the
//!   objective, following Spiess (1990), "A gradient approach for the O-D
//!   matrix adjustment problem". The gradient weights each count by the
//!   derivative of `|error|^p1 / p1`; the step length minimizes the squared
//!   error along that direction and is bounded so no cell turns negative.

use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;

use crate::data::{ClassDemand, CountObservation, CountSet};
use crate::error::{OdmeError, Result};
use crate::objective::ObjectiveFunction;
use crate::options::{GeometricMeanOptions, OdmeOptions, SpiessOptions};
use crate::select_link::SelectLinkCache;

/// Read-only view of the controller state handed to a scaling algorithm.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationState<'a> {
    pub classes: &'a [ClassDemand],
    pub observations: &'a CountSet,
    pub cache: &'a SelectLinkCache,
    pub objective: &'a ObjectiveFunction,
}

impl<'a> CalibrationState<'a> {
    /// Observations of `class`, each paired with its cached proportion matrix.
    pub fn class_observations(
        &self,
        class: &ClassDemand,
    ) -> Result<Vec<(&'a CountObservation, &'a DMatrix<f64>)>> {
        self.observations
            .as_slice()
            .iter()
            .enumerate()
            .filter(|(_, obs)| obs.class_index() == class.index())
            .map(|(index, obs)| {
                let proportion = self.cache.proportion(index).ok_or_else(|| {
                    OdmeError::MissingSelectLinkResult {
                        key: obs.key().clone(),
                    }
                })?;
                Ok((obs, proportion))
            })
            .collect()
    }
}

/// Strategy producing one multiplier matrix per class from the current discrepancies.
pub trait ScalingFactorGenerator: fmt::Debug {
    /// Short name of the algorithm.
    fn name(&self) -> &'static str;

    /// Proposes factors for every class, in class order.
    fn generate(&self, state: &CalibrationState<'_>) -> Result<Vec<DMatrix<f64>>>;
}

/// Selector for the available scaling algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingAlgorithm {
    GeometricMean,
    Spiess,
}

impl ScalingAlgorithm {
    /// Canonical name accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            Self::GeometricMean => "gmean",
            Self::Spiess => "spiess",
        }
    }

    /// Instantiates the algorithm with the tuning found in `options`.
    pub fn generator(self, options: &OdmeOptions) -> Result<Box<dyn ScalingFactorGenerator>> {
        Ok(match self {
            Self::GeometricMean => Box::new(GeometricMean::new(options.geometric_mean.clone())?),
            Self::Spiess => Box::new(Spiess::new(options.spiess.clone())?),
        })
    }
}

impl FromStr for ScalingAlgorithm {
    type Err = OdmeError;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gmean" | "geometric_mean" => Ok(Self::GeometricMean),
            "spiess" => Ok(Self::Spiess),
            _ => Err(OdmeError::UnknownAlgorithm {
                name: name.to_string(),
            }),
        }
    }
}

/// Geometric-mean balancing of per-count ratios.
#[derive(Clone, Debug)]
pub struct GeometricMean {
    floor: f64,
}

impl GeometricMean {
    pub fn new(options: GeometricMeanOptions) -> Result<Self> {
        if !options.floor.is_finite() || options.floor <= 0.0 {
            return Err(OdmeError::invalid_option(
                "geometric_mean.floor",
                format!("must be finite and positive, found {}", options.floor),
            ));
        }
        Ok(Self {
            floor: options.floor,
        })
    }

    /// Ratio contributed by an observation; `None` when nothing is assigned to scale.
    fn ratio(&self, obs: &CountObservation) -> Option<f64> {
        let assigned = obs.assigned();
        if !assigned.is_finite() || assigned <= 0.0 {
            log::warn!(
                "skipping count {} with assigned volume {assigned}",
                obs.key()
            );
            return None;
        }
        let ratio = obs.observed() / assigned;
        if ratio < self.floor {
            log::warn!(
                "ratio {ratio:.4} of count {} clipped to {}",
                obs.key(),
                self.floor
            );
            return Some(self.floor);
        }
        Some(ratio)
    }
}

impl ScalingFactorGenerator for GeometricMean {
    fn name(&self) -> &'static str {
        ScalingAlgorithm::GeometricMean.name()
    }

    fn generate(&self, state: &CalibrationState<'_>) -> Result<Vec<DMatrix<f64>>> {
        state
            .classes
            .iter()
            .map(|class| -> Result<DMatrix<f64>> {
                let zones = class.zones();
                let mut log_sum = DMatrix::<f64>::zeros(zones, zones);
                let mut touches = DMatrix::<usize>::zeros(zones, zones);

                for (obs, proportion) in state.class_observations(class)? {
                    let Some(ratio) = self.ratio(obs) else {
                        continue;
                    };
                    let ln_ratio = ratio.ln();
                    for col in 0..zones {
                        for row in 0..zones {
                            if proportion[(row, col)] > 0.0 {
                                log_sum[(row, col)] += ln_ratio;
                                touches[(row, col)] += 1;
                            }
                        }
                    }
                }

                Ok(log_sum.zip_map(&touches, |sum, count| {
                    if count == 0 {
                        1.0
                    } else {
                        (sum / count as f64).exp()
                    }
                }))
            })
            .collect()
    }
}

/// Gradient-based adjustment with an optimal, nonnegativity-preserving step.
#[derive(Clone, Debug)]
pub struct Spiess {
    max_step: Option<f64>,
}

impl Spiess {
    pub fn new(options: SpiessOptions) -> Result<Self> {
        if let Some(max_step) = options.max_step {
            if !max_step.is_finite() || max_step <= 0.0 {
                return Err(OdmeError::invalid_option(
                    "spiess.max_step",
                    format!("must be finite and positive, found {max_step}"),
                ));
            }
        }
        Ok(Self {
            max_step: options.max_step,
        })
    }

    /// Largest interval of step lengths keeping `1 - step * g` nonnegative on cells with demand.
    fn step_bounds(gradient: &DMatrix<f64>, demand: &DMatrix<f64>) -> (f64, f64) {
        let mut lower = f64::NEG_INFINITY;
        let mut upper = f64::INFINITY;
        for (g, d) in gradient.iter().zip(demand.iter()) {
            if *d <= 0.0 {
                continue;
            }
            if *g > 0.0 {
                upper = upper.min(1.0 / g);
            } else if *g < 0.0 {
                lower = lower.max(1.0 / g);
            }
        }
        (lower, upper)
    }

    fn class_factors(
        &self,
        class: &ClassDemand,
        observations: &[(&CountObservation, &DMatrix<f64>)],
        objective: &ObjectiveFunction,
    ) -> DMatrix<f64> {
        let zones = class.zones();
        let demand = class.current();

        // dZ/dD for Z = Σ |assigned - observed|^p1 / p1.
        let mut gradient = DMatrix::<f64>::zeros(zones, zones);
        for (obs, proportion) in observations {
            gradient += *proportion * objective.count_derivative(obs.error());
        }

        let weighted = demand.component_mul(&gradient);
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (obs, proportion) in observations {
            let flow_derivative = -proportion.component_mul(&weighted).sum();
            numerator += flow_derivative * (obs.observed() - obs.assigned());
            denominator += flow_derivative * flow_derivative;
        }

        let mut step = if denominator > 0.0 && numerator.is_finite() {
            numerator / denominator
        } else {
            0.0
        };
        let (lower, upper) = Self::step_bounds(&gradient, demand);
        step = step.clamp(lower, upper);
        if let Some(max_step) = self.max_step {
            step = step.clamp(-max_step, max_step);
        }
        log::trace!(
            "spiess step {step} for class `{}` within [{lower}, {upper}]",
            class.name()
        );

        gradient.map(|g| (1.0 - step * g).max(0.0))
    }
}

impl ScalingFactorGenerator for Spiess {
    fn name(&self) -> &'static str {
        ScalingAlgorithm::Spiess.name()
    }

    fn generate(&self, state: &CalibrationState<'_>) -> Result<Vec<DMatrix<f64>>> {
        state
            .classes
            .iter()
            .map(|class| -> Result<DMatrix<f64>> {
                let observations = state.class_observations(class)?;
                Ok(self.class_factors(class, &observations, state.objective))
            })
            .collect()
    }
}
