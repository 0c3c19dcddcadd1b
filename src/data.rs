//! Count observations, observation keys and per-class demand records used by the calibration.

use std::collections::{HashMap, HashSet};
use std::fmt;

use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{OdmeError, Result};

/// Identifier of a network link as reported by the assignment engine.
pub type LinkId = i64;

/// Link direction an observation refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Direction {
    /// Flow in the digitised direction of the link (`a → b`).
    Forward,
    /// Flow against the digitised direction (`b → a`).
    Backward,
    /// Flow in both directions combined.
    Total,
}

impl Direction {
    /// Parses the integer direction code used in count tables (`1`, `-1`, `0`).
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Forward),
            -1 => Ok(Self::Backward),
            0 => Ok(Self::Total),
            other => Err(OdmeError::InvalidDirection { code: other }),
        }
    }

    /// Integer code of the direction.
    pub fn code(self) -> i64 {
        match self {
            Self::Forward => 1,
            Self::Backward => -1,
            Self::Total => 0,
        }
    }

    /// Suffix appended to a class prefix to name its column in the link-flow table.
    pub fn column_suffix(self) -> &'static str {
        match self {
            Self::Forward => "_ab",
            Self::Backward => "_ba",
            Self::Total => "_tot",
        }
    }

    /// Full link-flow column name for a class with flow prefix `prefix`.
    pub fn column_name(self, prefix: &str) -> String {
        format!("{prefix}{}", self.column_suffix())
    }
}

impl TryFrom<i64> for Direction {
    type Error = OdmeError;

    fn try_from(code: i64) -> Result<Self> {
        Self::from_code(code)
    }
}

/// Composite key of a count observation and of its select-link query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObservationKey {
    /// Name of the user class the count belongs to.
    pub class: String,
    /// Observed link.
    pub link_id: LinkId,
    /// Observed direction on the link.
    pub direction: Direction,
}

impl ObservationKey {
    /// Builds a key from its three components.
    pub fn new<S: Into<String>>(class: S, link_id: LinkId, direction: Direction) -> Self {
        Self {
            class: class.into(),
            link_id,
            direction,
        }
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(class `{}`, link {}, direction {})",
            self.class,
            self.link_id,
            self.direction.code()
        )
    }
}

/// A single traffic count together with the volume currently assigned to it.
#[derive(Clone, Debug, Serialize)]
pub struct CountObservation {
    key: ObservationKey,
    observed: f64,
    assigned: f64,
    #[serde(skip)]
    pub(crate) class_index: usize,
}

impl CountObservation {
    /// Key identifying the observation.
    pub fn key(&self) -> &ObservationKey {
        &self.key
    }

    /// Observed (ground-truth) volume.
    pub fn observed(&self) -> f64 {
        self.observed
    }

    /// Volume currently assigned to the observed link/direction.
    pub fn assigned(&self) -> f64 {
        self.assigned
    }

    /// Signed discrepancy `assigned - observed`.
    pub fn error(&self) -> f64 {
        self.assigned - self.observed
    }

    /// Position of the observation's class in the controller's class list.
    pub fn class_index(&self) -> usize {
        self.class_index
    }

    pub(crate) fn set_assigned(&mut self, volume: f64) {
        self.assigned = volume;
    }
}

/// Ordered, duplicate-free set of count observations.
#[derive(Clone, Debug, Default)]
pub struct CountSet {
    observations: Vec<CountObservation>,
}

impl CountSet {
    /// Starts building a count set.
    pub fn builder() -> CountSetBuilder {
        CountSetBuilder::default()
    }

    /// Number of observations across all classes.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Returns `true` when no counts were supplied.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Iterates over all observations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &CountObservation> {
        self.observations.iter()
    }

    /// Iterates over the observations of the class at `class_index`.
    pub fn for_class(&self, class_index: usize) -> impl Iterator<Item = &CountObservation> {
        self.observations
            .iter()
            .filter(move |obs| obs.class_index == class_index)
    }

    /// Read-only view of the observations.
    pub fn as_slice(&self) -> &[CountObservation] {
        &self.observations
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CountObservation> {
        self.observations.iter_mut()
    }

    /// Resolves every observation's class name against `classes`.
    pub(crate) fn bind(&mut self, classes: &[ClassDemand]) -> Result<()> {
        let index: HashMap<&str, usize> = classes
            .iter()
            .map(|class| (class.name(), class.index()))
            .collect();
        for obs in &mut self.observations {
            obs.class_index = *index
                .get(obs.key.class.as_str())
                .ok_or_else(|| OdmeError::UnknownClass {
                    class: obs.key.class.clone(),
                })?;
        }
        Ok(())
    }
}

/// Builder that validates observation keys and volumes before constructing a [`CountSet`].
#[derive(Debug, Default)]
pub struct CountSetBuilder {
    rows: Vec<(ObservationKey, f64)>,
}

impl CountSetBuilder {
    /// Appends an observation.
    pub fn observation<S: Into<String>>(
        mut self,
        class: S,
        link_id: LinkId,
        direction: Direction,
        observed: f64,
    ) -> Self {
        self.rows
            .push((ObservationKey::new(class, link_id, direction), observed));
        self
    }

    /// Appends an observation whose direction is given by its integer code.
    pub fn observation_with_code<S: Into<String>>(
        self,
        class: S,
        link_id: LinkId,
        direction_code: i64,
        observed: f64,
    ) -> Result<Self> {
        let direction = Direction::from_code(direction_code)?;
        Ok(self.observation(class, link_id, direction, observed))
    }

    /// Finalizes construction after checking key uniqueness and volume validity.
    pub fn build(self) -> Result<CountSet> {
        let mut seen = HashSet::with_capacity(self.rows.len());
        let mut observations = Vec::with_capacity(self.rows.len());

        for (index, (key, observed)) in self.rows.into_iter().enumerate() {
            if !observed.is_finite() || observed < 0.0 {
                return Err(OdmeError::InvalidObservation {
                    index,
                    volume: observed,
                });
            }
            if !seen.insert(key.clone()) {
                return Err(OdmeError::DuplicateObservation { key });
            }
            observations.push(CountObservation {
                key,
                observed,
                assigned: 0.0,
                class_index: 0,
            });
        }

        Ok(CountSet { observations })
    }
}

/// A user class as exposed by the assignment engine: name, flow columns and demand.
#[derive(Clone, Debug)]
pub struct UserClass {
    /// Unique class name; observations refer to it.
    pub name: String,
    /// Prefix of this class's columns in the link-flow table (`{prefix}_ab`, ...).
    pub flow_prefix: String,
    /// Demand matrix the class is loaded with before calibration.
    pub demand: DMatrix<f64>,
}

impl UserClass {
    /// Creates a class whose flow columns are prefixed with its own name.
    pub fn new<S: Into<String>>(name: S, demand: DMatrix<f64>) -> Self {
        let name = name.into();
        Self {
            flow_prefix: name.clone(),
            name,
            demand,
        }
    }

    /// Overrides the link-flow column prefix.
    pub fn with_flow_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.flow_prefix = prefix.into();
        self
    }
}

/// Per-class calibration record holding the initial and the current demand matrix.
#[derive(Clone, Debug)]
pub struct ClassDemand {
    name: String,
    flow_prefix: String,
    index: usize,
    initial: DMatrix<f64>,
    current: DMatrix<f64>,
}

impl ClassDemand {
    /// Validates a user class and captures its demand as both initial and current matrix.
    pub fn new(index: usize, class: UserClass) -> Result<Self> {
        let UserClass {
            name,
            flow_prefix,
            demand,
        } = class;

        if demand.nrows() != demand.ncols() {
            return Err(OdmeError::dimension_mismatch(
                "demand matrix columns",
                demand.nrows(),
                demand.ncols(),
            ));
        }
        for col in 0..demand.ncols() {
            for row in 0..demand.nrows() {
                let value = demand[(row, col)];
                if !value.is_finite() || value < 0.0 {
                    return Err(OdmeError::InvalidDemand {
                        class: name,
                        row,
                        col,
                        value,
                    });
                }
            }
        }

        Ok(Self {
            name,
            flow_prefix,
            index,
            initial: demand.clone(),
            current: demand,
        })
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link-flow column prefix.
    pub fn flow_prefix(&self) -> &str {
        &self.flow_prefix
    }

    /// Position of the class in the controller's ordered class list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of zones (rows and columns of the demand matrix).
    pub fn zones(&self) -> usize {
        self.initial.nrows()
    }

    /// Demand captured at construction.
    pub fn initial(&self) -> &DMatrix<f64> {
        &self.initial
    }

    /// Demand as of the latest inner iteration.
    pub fn current(&self) -> &DMatrix<f64> {
        &self.current
    }

    /// Multiplies the current demand elementwise by `factors`, clamping results at zero.
    pub(crate) fn apply_factors(&mut self, factors: &DMatrix<f64>) {
        self.current.component_mul_assign(factors);
        self.current.apply(|cell| {
            if cell.is_nan() || *cell < 0.0 {
                *cell = 0.0;
            }
        });
    }
}
