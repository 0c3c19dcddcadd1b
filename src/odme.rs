//! Calibration controller running the outer/inner ODME loop.

use std::collections::HashSet;

use nalgebra::DMatrix;

use crate::assignment::AssignmentEngine;
use crate::convergence::{CalibrationStatus, CalibrationSummary, ConvergenceState, IterationState};
use crate::data::{ClassDemand, CountSet};
use crate::error::{OdmeError, Result};
use crate::objective::ObjectiveFunction;
use crate::options::{OdmeOptions, StopCriteria};
use crate::scaling::{CalibrationState, ScalingAlgorithm, ScalingFactorGenerator};
use crate::select_link::{extract_volumes, select_link_queries, SelectLinkCache};
use crate::stats::{
    cumulative_factors, CumulativeFactorStatistics, CumulativeFactors, DescriptiveStatistics,
    DiagnosticsLog, FactorRecord, IterationSnapshot, StatisticsRow,
};

/// Origin-destination matrix estimation against observed link counts.
///
/// The controller owns the assignment engine, the demand of every class and all
/// diagnostics. Each outer iteration rests on one full assignment; the inner
/// iterations in between rescale demand using the select-link proportions of
/// that assignment, without re-running it.
#[derive(Debug)]
pub struct Odme<E> {
    engine: E,
    classes: Vec<ClassDemand>,
    observations: CountSet,
    cache: SelectLinkCache,
    objective: ObjectiveFunction,
    algorithm: Box<dyn ScalingFactorGenerator>,
    stop: StopCriteria,
    iteration: IterationState,
    convergence: ConvergenceState,
    log: DiagnosticsLog,
    executed: bool,
}

impl<E: AssignmentEngine> Odme<E> {
    /// Validates the configuration and registers one select-link query per count.
    pub fn new(mut engine: E, counts: CountSet, options: OdmeOptions) -> Result<Self> {
        options.stop.validate()?;
        let objective = ObjectiveFunction::try_from(options.objective)?;
        let algorithm = options
            .algorithm
            .parse::<ScalingAlgorithm>()?
            .generator(&options)?;

        let mut names = HashSet::new();
        let classes = engine
            .classes()
            .into_iter()
            .enumerate()
            .map(|(index, class)| {
                if !names.insert(class.name.clone()) {
                    return Err(OdmeError::DuplicateClass { class: class.name });
                }
                ClassDemand::new(index, class)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut observations = counts;
        observations.bind(&classes)?;

        engine
            .register_select_links(&select_link_queries(&observations))
            .map_err(OdmeError::Assignment)?;

        log::info!(
            "ODME configured with {} classes, {} counts, algorithm `{}`",
            classes.len(),
            observations.len(),
            algorithm.name()
        );

        Ok(Self {
            engine,
            classes,
            observations,
            cache: SelectLinkCache::default(),
            objective,
            algorithm,
            stop: options.stop,
            iteration: IterationState::default(),
            convergence: ConvergenceState::default(),
            log: DiagnosticsLog::default(),
            executed: false,
        })
    }

    /// Runs the calibration until convergence or until the outer iteration cap.
    pub fn execute(&mut self) -> Result<CalibrationSummary> {
        if self.executed {
            return Err(OdmeError::AlreadyExecuted);
        }
        self.executed = true;
        self.log.start_clock();

        self.perform_assignment()?;

        while self.iteration.outer < self.stop.max_outer
            && self.convergence.above(self.stop.outer_tolerance)
        {
            self.iteration.begin_outer();
            self.log_iteration();
            log::info!(
                "outer iteration {} starting at objective {:?}",
                self.iteration.outer,
                self.convergence.last()
            );

            // At least one inner iteration per outer iteration.
            self.convergence.reset_delta();
            while self.iteration.inner < self.stop.max_inner
                && self.convergence.delta() > self.stop.inner_tolerance
            {
                self.inner_iteration()?;
                self.iteration.complete_inner();
                self.log_iteration();
                log::debug!(
                    "inner iteration {}.{}: objective {:?}, change {}",
                    self.iteration.outer,
                    self.iteration.inner,
                    self.convergence.last(),
                    self.convergence.delta()
                );
            }

            self.perform_assignment()?;
        }

        self.iteration.finish();
        self.log_iteration();

        let objective = self.convergence.last().unwrap_or(0.0);
        let status = if self.convergence.above(self.stop.outer_tolerance) {
            CalibrationStatus::MaxOuterReached
        } else {
            CalibrationStatus::Converged
        };
        log::info!(
            "ODME finished ({status:?}) after {} assignments with objective {objective}",
            self.iteration.assignments
        );

        Ok(CalibrationSummary {
            status,
            iterations: self.iteration,
            objective,
            elapsed_seconds: self.log.elapsed_seconds(),
        })
    }

    /// Rescales demand once using the frozen select-link proportions.
    fn inner_iteration(&mut self) -> Result<()> {
        let factors = {
            let state = CalibrationState {
                classes: &self.classes,
                observations: &self.observations,
                cache: &self.cache,
                objective: &self.objective,
            };
            self.algorithm.generate(&state)?
        };

        if factors.len() != self.classes.len() {
            return Err(OdmeError::dimension_mismatch(
                "scaling factor classes",
                self.classes.len(),
                factors.len(),
            ));
        }
        for (class, factor) in self.classes.iter().zip(&factors) {
            if factor.shape() != class.current().shape() {
                return Err(OdmeError::dimension_mismatch(
                    "scaling factor rows",
                    class.zones(),
                    factor.nrows(),
                ));
            }
        }

        self.log
            .log_factors(&self.iteration, &self.classes, &factors);
        for (class, factor) in self.classes.iter_mut().zip(&factors) {
            class.apply_factors(factor);
        }

        self.cache
            .estimate_volumes(&mut self.observations, &self.classes);
        self.evaluate_objective();
        Ok(())
    }

    /// Loads current demand, assigns it, and refreshes proportions, volumes and objective.
    fn perform_assignment(&mut self) -> Result<()> {
        for class in &self.classes {
            self.engine
                .set_demand(class.name(), class.current())
                .map_err(OdmeError::Assignment)?;
        }
        self.engine.execute().map_err(OdmeError::Assignment)?;
        self.iteration.record_assignment();

        self.cache.rebuild(
            self.engine.select_link_results(),
            &self.observations,
            &self.classes,
        )?;
        extract_volumes(
            &self.engine.link_flow_results(),
            &mut self.observations,
            &self.classes,
        )?;
        self.evaluate_objective();

        log::debug!(
            "assignment {} complete, objective {:?}",
            self.iteration.assignments,
            self.convergence.last()
        );
        Ok(())
    }

    fn evaluate_objective(&mut self) {
        let value = self.objective.evaluate(&self.observations, &self.classes);
        self.convergence.record(value);
    }

    fn log_iteration(&mut self) {
        self.log.log_iteration(
            &self.iteration,
            &self.convergence,
            &self.observations,
            &self.classes,
        );
    }
}

impl<E> Odme<E> {
    /// Current demand matrix of every class, in class order.
    pub fn demands(&self) -> Vec<&DMatrix<f64>> {
        self.classes.iter().map(ClassDemand::current).collect()
    }

    /// Current demand matrix of the named class.
    pub fn demand(&self, class: &str) -> Option<&DMatrix<f64>> {
        self.classes
            .iter()
            .find(|entry| entry.name() == class)
            .map(ClassDemand::current)
    }

    /// Per-class calibration records.
    pub fn classes(&self) -> &[ClassDemand] {
        &self.classes
    }

    /// Count observations with their latest assigned volumes.
    pub fn observations(&self) -> &CountSet {
        &self.observations
    }

    /// One row per count observation per logged iteration.
    pub fn statistics(&self) -> Vec<StatisticsRow> {
        self.log.statistics()
    }

    /// Logged iterations, including those of a run without counts.
    pub fn snapshots(&self) -> &[IterationSnapshot] {
        self.log.snapshots()
    }

    /// Scaling-factor statistics per class per inner iteration.
    pub fn factor_statistics(&self) -> &[FactorRecord] {
        self.log.factor_records()
    }

    /// Final over initial demand per class.
    pub fn cumulative_factors(&self) -> Vec<CumulativeFactors> {
        self.classes.iter().map(cumulative_factors).collect()
    }

    /// Descriptive statistics of each class's cumulative factors.
    pub fn cumulative_factor_statistics(&self) -> Vec<CumulativeFactorStatistics> {
        self.cumulative_factors()
            .into_iter()
            .map(|cumulative| CumulativeFactorStatistics {
                statistics: DescriptiveStatistics::from_matrix(&cumulative.factors),
                class: cumulative.class,
            })
            .collect()
    }

    pub fn iteration(&self) -> &IterationState {
        &self.iteration
    }

    pub fn convergence(&self) -> &ConvergenceState {
        &self.convergence
    }

    pub fn objective(&self) -> &ObjectiveFunction {
        &self.objective
    }

    /// Name of the scaling algorithm in use.
    pub fn algorithm(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Releases the engine, e.g. to inspect its final assignment.
    pub fn into_engine(self) -> E {
        self.engine
    }
}
