use thiserror::Error;

use crate::data::{LinkId, ObservationKey};

/// Boxed error raised by an [`AssignmentEngine`](crate::assignment::AssignmentEngine).
pub type AssignmentError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for `odmers` operations.
#[derive(Debug, Error)]
pub enum OdmeError {
    /// Raised when provided matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, usually the zone count of the class.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when two count observations share the same (class, link, direction).
    #[error("duplicate count observation for {key}")]
    DuplicateObservation { key: ObservationKey },

    /// Raised when the engine reports two classes under the same name.
    #[error("user class `{class}` is defined more than once")]
    DuplicateClass { class: String },

    /// Raised when an observation references a class the engine does not know.
    #[error("count observation references unknown class `{class}`")]
    UnknownClass { class: String },

    /// Raised when a route references a zone outside the class's demand matrix.
    #[error("zone {zone} is outside the {zones} zones of class `{class}`")]
    ZoneOutOfRange {
        class: String,
        zone: usize,
        zones: usize,
    },

    /// Raised when an objective exponent is outside its admissible range.
    #[error("objective exponent {name} must be {requirement}, found {value}")]
    InvalidExponent {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },

    /// Raised when the algorithm selector does not name a known algorithm.
    #[error("unknown scaling algorithm `{name}` (expected one of: gmean, spiess)")]
    UnknownAlgorithm { name: String },

    /// Raised when a direction code is not one of `1`, `-1` or `0`.
    #[error("direction code {code} is invalid (expected 1, -1 or 0)")]
    InvalidDirection { code: i64 },

    /// Raised when an observed volume is negative or not finite.
    #[error("observed volume at index {index} must be finite and nonnegative, found {volume}")]
    InvalidObservation { index: usize, volume: f64 },

    /// Raised when a demand matrix contains a negative or non-finite cell.
    #[error("demand matrix of class `{class}` has invalid cell ({row}, {col}) = {value}")]
    InvalidDemand {
        class: String,
        row: usize,
        col: usize,
        value: f64,
    },

    /// Raised when a tuning option is outside its admissible range.
    #[error("option {name} is invalid: {reason}")]
    InvalidOption {
        name: &'static str,
        reason: String,
    },

    /// Raised when the engine produced no select-link matrix for a registered key.
    #[error("assignment returned no select-link result for {key}")]
    MissingSelectLinkResult { key: ObservationKey },

    /// Raised when an observed link is absent from the link-flow results.
    #[error("link {link_id} is not present in the assignment link-flow results")]
    UnknownLinkInResults { link_id: LinkId },

    /// Raised when the link-flow results lack the column a class/direction maps to.
    #[error("assignment link-flow results have no column `{column}`")]
    MissingFlowColumn { column: String },

    /// Raised when `execute` is called on a controller that has already run.
    #[error("calibration has already been executed on this controller")]
    AlreadyExecuted,

    /// Failure reported by the assignment engine, passed through untouched.
    #[error("assignment failed")]
    Assignment(#[source] AssignmentError),
}

impl OdmeError {
    /// Helper to format a [`DimensionMismatch`](OdmeError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for rejecting an out-of-range option value.
    pub fn invalid_option(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors caused by invalid inputs detected at construction.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::DuplicateObservation { .. }
                | Self::DuplicateClass { .. }
                | Self::UnknownClass { .. }
                | Self::ZoneOutOfRange { .. }
                | Self::InvalidExponent { .. }
                | Self::UnknownAlgorithm { .. }
                | Self::InvalidDirection { .. }
                | Self::InvalidObservation { .. }
                | Self::InvalidDemand { .. }
                | Self::InvalidOption { .. }
        )
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, OdmeError>;
