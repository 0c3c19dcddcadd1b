use std::collections::BTreeMap;

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use odmers::assignment::{FixedRouteAssignment, RouteLeg, SelectLinkQueries};
use odmers::data::{CountSet, Direction, ObservationKey, UserClass};
use odmers::error::AssignmentError;
use odmers::{
    AssignmentEngine, CalibrationStatus, LinkFlowTable, Odme, OdmeError, OdmeOptions, StopCriteria,
};

fn base_demand() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &[10.0, 20.0, 30.0, 40.0])
}

/// Link 1 carries cell (0, 1) forward and cell (1, 0) backward; link 2 carries (0, 1) only.
fn two_link_engine() -> FixedRouteAssignment {
    FixedRouteAssignment::new(vec![1, 2, 3])
        .with_class(UserClass::new("car", base_demand()))
        .with_leg("car", 0, 1, RouteLeg::new(1, Direction::Forward, 1.0))
        .and_then(|engine| engine.with_leg("car", 1, 0, RouteLeg::new(1, Direction::Backward, 1.0)))
        .and_then(|engine| engine.with_leg("car", 0, 1, RouteLeg::new(2, Direction::Forward, 1.0)))
        .and_then(|engine| engine.with_leg("car", 0, 1, RouteLeg::new(3, Direction::Forward, 1.0)))
        .unwrap()
}

/// Counts that no demand matrix can satisfy simultaneously.
fn conflicting_counts() -> CountSet {
    CountSet::builder()
        .observation("car", 1, Direction::Total, 100.0)
        .observation("car", 2, Direction::Forward, 10.0)
        .observation("car", 3, Direction::Forward, 50.0)
        .build()
        .unwrap()
}

fn stop(max_outer: usize, max_inner: usize, outer: f64, inner: f64) -> OdmeOptions {
    OdmeOptions::default().with_stop_criteria(StopCriteria::new(max_outer, max_inner, outer, inner))
}

/// Scenario A: one total count of 100 against 50 assigned doubles the routed cells.
#[test]
fn gmean_doubles_cells_feeding_an_undercounted_link() {
    let engine = FixedRouteAssignment::new(vec![1])
        .with_class(UserClass::new("car", base_demand()))
        .with_leg("car", 0, 1, RouteLeg::new(1, Direction::Forward, 1.0))
        .and_then(|engine| engine.with_leg("car", 1, 0, RouteLeg::new(1, Direction::Backward, 1.0)))
        .unwrap();
    let counts = CountSet::builder()
        .observation("car", 1, Direction::Total, 100.0)
        .build()
        .unwrap();

    let mut odme = Odme::new(engine, counts, stop(1, 1, 0.0, 0.0)).unwrap();
    let summary = odme.execute().unwrap();

    let factors = &odme.factor_statistics()[0];
    assert_eq!((factors.outer, factors.inner, factors.total_inner), (1, 0, 0));
    assert_relative_eq!(factors.statistics.max, 2.0, epsilon = 1e-12);
    assert_relative_eq!(factors.statistics.min, 1.0, epsilon = 1e-12);

    assert_relative_eq!(
        *odme.demand("car").unwrap(),
        DMatrix::from_row_slice(2, 2, &[10.0, 40.0, 60.0, 40.0]),
        epsilon = 1e-9
    );
    assert_relative_eq!(odme.observations().as_slice()[0].assigned(), 100.0, epsilon = 1e-9);
    assert_eq!(summary.status, CalibrationStatus::Converged);
    assert_eq!(summary.iterations.assignments, 2);
}

/// Scenario B: with `p2 = 0` the objective is the count term alone, however far demand drifts.
#[test]
fn disabled_regularization_ignores_demand_drift() {
    let options = stop(3, 5, 0.0, 0.0).with_objective(1.5, 0.0);
    let mut odme = Odme::new(two_link_engine(), conflicting_counts(), options).unwrap();
    odme.execute().unwrap();

    assert!(odme.demands()[0] != &base_demand());
    let expected: f64 = odme
        .observations()
        .iter()
        .map(|obs| (obs.observed() - obs.assigned()).abs().powf(1.5))
        .sum::<f64>()
        / 1.5;
    assert_relative_eq!(odme.convergence().last().unwrap(), expected, epsilon = 1e-12);
}

#[test]
fn enabled_regularization_adds_drift_penalty() {
    let options = stop(2, 3, 0.0, 0.0).with_objective(2.0, 1.0);
    let mut odme = Odme::new(two_link_engine(), conflicting_counts(), options).unwrap();
    odme.execute().unwrap();

    let counts: f64 = odme
        .observations()
        .iter()
        .map(|obs| (obs.observed() - obs.assigned()).powi(2))
        .sum::<f64>()
        / 2.0;
    let class = &odme.classes()[0];
    let drift: f64 = (class.initial() - class.current()).abs().sum();
    assert!(drift > 0.0);
    assert_relative_eq!(
        odme.convergence().last().unwrap(),
        counts + drift,
        epsilon = 1e-9
    );
}

/// Scenario C: without counts the objective is zero and only the cold-start assignment runs.
#[test]
fn zero_counts_stop_after_cold_start() {
    let mut odme = Odme::new(two_link_engine(), CountSet::default(), OdmeOptions::default()).unwrap();
    let summary = odme.execute().unwrap();

    assert_eq!(summary.status, CalibrationStatus::Converged);
    assert_eq!(summary.objective, 0.0);
    assert_eq!(summary.iterations.assignments, 1);
    assert_eq!(odme.engine().executions(), 1);
    assert_eq!(odme.snapshots().len(), 1);
    assert_eq!(odme.snapshots()[0].outer, 1);
    assert!(odme.statistics().is_empty());
    assert!(odme.factor_statistics().is_empty());
    assert_eq!(odme.demands()[0], &base_demand());
}

/// Scenario D: `max_inner = 0` leaves demand untouched and logs no factors.
#[test]
fn zero_inner_cap_only_reassigns() {
    let mut odme = Odme::new(two_link_engine(), conflicting_counts(), stop(2, 0, 0.0, 0.0)).unwrap();
    let summary = odme.execute().unwrap();

    assert_eq!(summary.status, CalibrationStatus::MaxOuterReached);
    assert_eq!(summary.iterations.assignments, 3);
    assert_eq!(summary.iterations.total_inner, 0);
    assert!(odme.factor_statistics().is_empty());
    assert_eq!(odme.demands()[0], &base_demand());
    // Two outer snapshots plus the final one.
    assert_eq!(odme.snapshots().len(), 3);
}

#[test]
fn every_outer_iteration_runs_an_inner_iteration() {
    // An inner tolerance this large would stop the loop immediately without the reset.
    let mut odme =
        Odme::new(two_link_engine(), conflicting_counts(), stop(3, 10, 0.0, 1e12)).unwrap();
    let summary = odme.execute().unwrap();

    assert_eq!(summary.iterations.outer, 4);
    assert_eq!(summary.iterations.total_inner, 3);
    let per_outer: Vec<(usize, usize)> = odme
        .factor_statistics()
        .iter()
        .map(|record| (record.outer, record.inner))
        .collect();
    assert_eq!(per_outer, vec![(1, 0), (2, 0), (3, 0)]);
}

#[test]
fn diagnostics_cover_every_logged_iteration() {
    let mut odme = Odme::new(two_link_engine(), conflicting_counts(), stop(2, 2, 0.0, 0.0)).unwrap();
    odme.execute().unwrap();

    let snapshots = odme.snapshots();
    // Per outer: one entry snapshot and two inner snapshots; then the final snapshot.
    assert_eq!(snapshots.len(), 2 * 3 + 1);
    let indices: Vec<(usize, usize, usize)> = snapshots
        .iter()
        .map(|s| (s.outer, s.inner, s.total_iteration))
        .collect();
    assert_eq!(
        indices,
        vec![
            (1, 0, 1),
            (1, 1, 2),
            (1, 2, 3),
            (2, 0, 4),
            (2, 1, 5),
            (2, 2, 6),
            (3, 0, 6)
        ]
    );
    assert!(snapshots[0].inner_convergence.is_infinite());
    assert!(snapshots.windows(2).all(|w| w[1].total_seconds >= w[0].total_seconds));

    let rows = odme.statistics();
    assert_eq!(rows.len(), snapshots.len() * 3);
    for row in &rows {
        assert_relative_eq!(row.error, row.assigned - row.observed);
    }
}

#[test]
fn invariants_hold_for_both_algorithms() {
    for algorithm in ["gmean", "spiess"] {
        let options = stop(4, 6, 0.0, 0.0).with_algorithm(algorithm);
        let mut odme = Odme::new(two_link_engine(), conflicting_counts(), options).unwrap();
        odme.execute().unwrap();

        let class = &odme.classes()[0];
        assert_eq!(class.current().shape(), class.initial().shape());
        assert!(class.current().iter().all(|cell| *cell >= 0.0));

        // Accessors are pure.
        let first: Vec<DMatrix<f64>> = odme.demands().into_iter().cloned().collect();
        let second: Vec<DMatrix<f64>> = odme.demands().into_iter().cloned().collect();
        assert_eq!(first, second);

        let cumulative = &odme.cumulative_factors()[0];
        for ((factor, current), initial) in cumulative
            .factors
            .iter()
            .zip(class.current().iter())
            .zip(class.initial().iter())
        {
            if *initial == 0.0 {
                assert_eq!(*factor, 1.0);
            } else {
                assert_relative_eq!(*factor, current / initial, epsilon = 1e-12);
            }
        }
        let summary = &odme.cumulative_factor_statistics()[0];
        assert_eq!(summary.statistics.count, 4);
    }
}

#[test]
fn classes_are_calibrated_independently() {
    let engine = FixedRouteAssignment::new(vec![1])
        .with_class(UserClass::new("car", base_demand()).with_flow_prefix("pce_car"))
        .with_class(UserClass::new("truck", base_demand()))
        .with_leg("car", 0, 1, RouteLeg::new(1, Direction::Forward, 1.0))
        .and_then(|engine| engine.with_leg("truck", 0, 1, RouteLeg::new(1, Direction::Forward, 1.0)))
        .unwrap();
    let counts = CountSet::builder()
        .observation("car", 1, Direction::Forward, 60.0)
        .build()
        .unwrap();

    let mut odme = Odme::new(engine, counts, stop(1, 1, 0.0, 0.0)).unwrap();
    odme.execute().unwrap();

    assert_relative_eq!(odme.demand("car").unwrap()[(0, 1)], 60.0, epsilon = 1e-9);
    assert_eq!(odme.demand("truck").unwrap(), &base_demand());
    assert_eq!(odme.factor_statistics().len(), 2);
    assert!(odme.demand("bus").is_none());
}

#[test]
fn records_serialize_to_json() {
    let mut odme = Odme::new(two_link_engine(), conflicting_counts(), stop(1, 1, 0.0, 0.0)).unwrap();
    odme.execute().unwrap();

    let rows = serde_json::to_value(odme.statistics()).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), odme.statistics().len());
    assert_eq!(rows[0]["direction"], "Total");

    let factors = serde_json::to_value(odme.factor_statistics()).unwrap();
    assert!(factors[0]["mean"].is_number());
    assert_eq!(factors[0]["class"], "car");
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Diverge,
    DropSelectLink,
    DropLinks,
}

#[derive(Debug)]
struct FaultyEngine {
    inner: FixedRouteAssignment,
    fault: Fault,
}

impl AssignmentEngine for FaultyEngine {
    fn classes(&self) -> Vec<UserClass> {
        self.inner.classes()
    }

    fn register_select_links(&mut self, queries: &SelectLinkQueries) -> Result<(), AssignmentError> {
        self.inner.register_select_links(queries)
    }

    fn set_demand(&mut self, class: &str, demand: &DMatrix<f64>) -> Result<(), AssignmentError> {
        self.inner.set_demand(class, demand)
    }

    fn execute(&mut self) -> Result<(), AssignmentError> {
        match self.fault {
            Fault::Diverge => Err("assignment diverged".into()),
            _ => self.inner.execute(),
        }
    }

    fn select_link_results(&self) -> BTreeMap<ObservationKey, DMatrix<f64>> {
        match self.fault {
            Fault::DropSelectLink => BTreeMap::new(),
            _ => self.inner.select_link_results(),
        }
    }

    fn link_flow_results(&self) -> LinkFlowTable {
        match self.fault {
            Fault::DropLinks => LinkFlowTable::new(Vec::new()),
            _ => self.inner.link_flow_results(),
        }
    }
}

fn run_faulty(fault: Fault) -> OdmeError {
    let engine = FaultyEngine {
        inner: two_link_engine(),
        fault,
    };
    let mut odme = Odme::new(engine, conflicting_counts(), OdmeOptions::default()).unwrap();
    odme.execute().unwrap_err()
}

#[test]
fn engine_failures_surface_unchanged() {
    match run_faulty(Fault::Diverge) {
        OdmeError::Assignment(source) => assert_eq!(source.to_string(), "assignment diverged"),
        other => panic!("expected assignment error, got {other:?}"),
    }
    assert!(matches!(
        run_faulty(Fault::DropSelectLink),
        OdmeError::MissingSelectLinkResult { .. }
    ));
    assert!(matches!(
        run_faulty(Fault::DropLinks),
        OdmeError::UnknownLinkInResults { link_id: 1 }
    ));
}

#[test]
fn duplicate_classes_are_rejected() {
    let engine = FixedRouteAssignment::new(vec![1])
        .with_class(UserClass::new("car", base_demand()))
        .with_class(UserClass::new("car", base_demand()));
    let result = Odme::new(engine, CountSet::default(), OdmeOptions::default());
    assert!(matches!(result, Err(OdmeError::DuplicateClass { .. })));
}
