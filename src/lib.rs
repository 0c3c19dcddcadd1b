//! Origin-destination matrix estimation (ODME) against observed traffic counts.
//!
//! This crate calibrates the demand matrices of a traffic-assignment model so
//! that assigned link flows reproduce a set of observed counts. It offers tools to
//!
//! - describe counts and per-class demand (`data` module),
//! - talk to an assignment procedure through a narrow trait (`assignment` module),
//! - cache select-link proportions and re-estimate volumes from them (`select_link` module),
//! - evaluate the calibration objective (`objective` module),
//! - generate demand scaling factors (`scaling` module), and
//! - run the outer/inner calibration loop with full diagnostics (`odme` module).
//!
//! Path finding, equilibrium assignment and volume-delay functions are left to
//! the [`AssignmentEngine`] implementation. Each outer iteration runs one full
//! assignment; between assignments, inner iterations rescale demand using the
//! select-link proportions of the last assignment, which is far cheaper than
//! re-assigning.
//!
//! # Quick start
//!
//! ```no_run
//! use odmers::assignment::{FixedRouteAssignment, RouteLeg};
//! use odmers::data::{CountSet, Direction, UserClass};
//! use odmers::{Odme, OdmeOptions, StopCriteria};
//! use nalgebra::DMatrix;
//!
//! let demand = DMatrix::from_row_slice(2, 2, &[10.0, 20.0, 30.0, 40.0]);
//! let engine = FixedRouteAssignment::new(vec![1])
//!     .with_class(UserClass::new("car", demand))
//!     .with_leg("car", 0, 1, RouteLeg::new(1, Direction::Forward, 1.0))
//!     .and_then(|engine| engine.with_leg("car", 1, 0, RouteLeg::new(1, Direction::Backward, 1.0)))
//!     .expect("routes inside the demand matrix");
//!
//! let counts = CountSet::builder()
//!     .observation("car", 1, Direction::Total, 100.0)
//!     .build()
//!     .expect("unique counts");
//!
//! let options = OdmeOptions::default()
//!     .with_stop_criteria(StopCriteria::new(5, 10, 1e-6, 1e-6))
//!     .with_algorithm("spiess");
//!
//! let mut odme = Odme::new(engine, counts, options).expect("valid configuration");
//! let summary = odme.execute().expect("calibrated");
//! println!("{:?}: {:?}", summary.status, odme.demands());
//! ```
//!
//! Classes are calibrated independently; no coupling between classes is
//! modelled beyond the shared objective value.

pub mod assignment;
pub mod convergence;
pub mod data;
pub mod error;
pub mod objective;
pub mod odme;
pub mod options;
pub mod scaling;
pub mod select_link;
pub mod stats;

pub use assignment::{AssignmentEngine, LinkFlowTable};
pub use convergence::{CalibrationStatus, CalibrationSummary};
pub use error::{OdmeError, Result};
pub use odme::Odme;
pub use options::{OdmeOptions, StopCriteria};
pub use scaling::{ScalingAlgorithm, ScalingFactorGenerator};
