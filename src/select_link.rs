//! Select-link proportion cache and the two ways of filling assigned volumes.
//!
//! After every full assignment the engine's select-link OD matrices are divided
//! by the current demand, giving for each observation the fraction of every OD
//! cell that crosses the observed link/direction. Inner iterations reuse this
//! frozen snapshot to re-estimate assigned volumes as `Σ P ⊙ D` without running
//! the assignment again.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::assignment::{LinkFlowTable, SelectLinkQueries};
use crate::data::{ClassDemand, CountSet, ObservationKey};
use crate::error::{OdmeError, Result};

/// One select-link query per observation, keyed by the observation itself.
pub fn select_link_queries(observations: &CountSet) -> SelectLinkQueries {
    observations
        .iter()
        .map(|obs| {
            let key = obs.key().clone();
            let query = vec![(key.link_id, key.direction)];
            (key, query)
        })
        .collect()
}

/// Divides select-link flow by demand; cells without demand or with an undefined ratio become 0.
pub fn proportion_matrix(select_link: &DMatrix<f64>, demand: &DMatrix<f64>) -> DMatrix<f64> {
    select_link.zip_map(demand, |flow, total| {
        if total > 0.0 {
            let ratio = flow / total;
            if ratio.is_finite() {
                return ratio;
            }
        }
        0.0
    })
}

/// Proportion matrices aligned with the order of the count observations.
#[derive(Clone, Debug, Default)]
pub struct SelectLinkCache {
    proportions: Vec<DMatrix<f64>>,
}

impl SelectLinkCache {
    /// Replaces the snapshot with proportions derived from a fresh assignment.
    pub fn rebuild(
        &mut self,
        mut results: BTreeMap<ObservationKey, DMatrix<f64>>,
        observations: &CountSet,
        classes: &[ClassDemand],
    ) -> Result<()> {
        let mut proportions = Vec::with_capacity(observations.len());
        for obs in observations.iter() {
            let select_link = results
                .remove(obs.key())
                .ok_or_else(|| OdmeError::MissingSelectLinkResult {
                    key: obs.key().clone(),
                })?;
            let demand = classes[obs.class_index()].current();
            if select_link.nrows() != demand.nrows() {
                return Err(OdmeError::dimension_mismatch(
                    "select-link matrix rows",
                    demand.nrows(),
                    select_link.nrows(),
                ));
            }
            if select_link.ncols() != demand.ncols() {
                return Err(OdmeError::dimension_mismatch(
                    "select-link matrix columns",
                    demand.ncols(),
                    select_link.ncols(),
                ));
            }
            proportions.push(proportion_matrix(&select_link, demand));
        }
        self.proportions = proportions;
        Ok(())
    }

    /// Proportion matrix of the observation at `index`.
    pub fn proportion(&self, index: usize) -> Option<&DMatrix<f64>> {
        self.proportions.get(index)
    }

    /// Number of cached matrices.
    pub fn len(&self) -> usize {
        self.proportions.len()
    }

    /// Returns `true` before the first rebuild or when there are no observations.
    pub fn is_empty(&self) -> bool {
        self.proportions.is_empty()
    }

    /// Re-estimates every assigned volume as `Σ P ⊙ D` with the current demand.
    pub fn estimate_volumes(&self, observations: &mut CountSet, classes: &[ClassDemand]) {
        for (obs, proportion) in observations.iter_mut().zip(&self.proportions) {
            let demand = classes[obs.class_index()].current();
            obs.set_assigned(proportion.component_mul(demand).sum());
        }
    }
}

/// Copies each observation's assigned volume from the engine's link-flow table.
pub fn extract_volumes(
    table: &LinkFlowTable,
    observations: &mut CountSet,
    classes: &[ClassDemand],
) -> Result<()> {
    for obs in observations.iter_mut() {
        let key = obs.key();
        if !table.contains_link(key.link_id) {
            return Err(OdmeError::UnknownLinkInResults {
                link_id: key.link_id,
            });
        }
        let column = key
            .direction
            .column_name(classes[obs.class_index()].flow_prefix());
        let volume = table
            .value(key.link_id, &column)
            .ok_or(OdmeError::MissingFlowColumn { column })?;
        obs.set_assigned(if volume.is_nan() { 0.0 } else { volume });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    use super::*;
    use crate::data::{Direction, UserClass};

    fn setup() -> (Vec<ClassDemand>, CountSet) {
        let demand = DMatrix::from_row_slice(2, 2, &[10.0, 20.0, 0.0, 40.0]);
        let classes = vec![ClassDemand::new(0, UserClass::new("car", demand)).unwrap()];
        let mut counts = CountSet::builder()
            .observation("car", 5, Direction::Forward, 30.0)
            .build()
            .unwrap();
        counts.bind(&classes).unwrap();
        (classes, counts)
    }

    #[test]
    fn undefined_proportions_resolve_to_zero() {
        let select_link = DMatrix::from_row_slice(2, 2, &[5.0, 20.0, 0.0, 0.0]);
        let demand = DMatrix::from_row_slice(2, 2, &[10.0, 20.0, 0.0, 40.0]);
        let proportions = proportion_matrix(&select_link, &demand);
        assert_eq!(
            proportions,
            DMatrix::from_row_slice(2, 2, &[0.5, 1.0, 0.0, 0.0])
        );
    }

    #[test]
    fn rebuild_requires_every_registered_key() {
        let (classes, counts) = setup();
        let mut cache = SelectLinkCache::default();
        let result = cache.rebuild(BTreeMap::new(), &counts, &classes);
        assert!(matches!(
            result,
            Err(OdmeError::MissingSelectLinkResult { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn rebuild_rejects_misshaped_results() {
        let (classes, counts) = setup();
        let mut results = BTreeMap::new();
        results.insert(
            ObservationKey::new("car", 5, Direction::Forward),
            DMatrix::zeros(3, 2),
        );
        let mut cache = SelectLinkCache::default();
        assert!(matches!(
            cache.rebuild(results, &counts, &classes),
            Err(OdmeError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn cached_estimate_tracks_demand_changes() {
        let (mut classes, mut counts) = setup();
        let mut results = BTreeMap::new();
        results.insert(
            ObservationKey::new("car", 5, Direction::Forward),
            DMatrix::from_row_slice(2, 2, &[5.0, 20.0, 0.0, 0.0]),
        );
        let mut cache = SelectLinkCache::default();
        cache.rebuild(results, &counts, &classes).unwrap();

        cache.estimate_volumes(&mut counts, &classes);
        assert_relative_eq!(counts.as_slice()[0].assigned(), 25.0);

        classes[0].apply_factors(&DMatrix::from_element(2, 2, 2.0));
        cache.estimate_volumes(&mut counts, &classes);
        assert_relative_eq!(counts.as_slice()[0].assigned(), 50.0);
    }

    #[test]
    fn extraction_reads_direction_column() {
        let (classes, mut counts) = setup();
        let table = LinkFlowTable::new(vec![4, 5])
            .with_column("car_ab", DVector::from_vec(vec![1.0, 12.5]))
            .and_then(|table| table.with_column("car_ba", DVector::from_vec(vec![2.0, 7.0])))
            .unwrap();
        extract_volumes(&table, &mut counts, &classes).unwrap();
        assert_relative_eq!(counts.as_slice()[0].assigned(), 12.5);

        let missing_link = LinkFlowTable::new(vec![4])
            .with_column("car_ab", DVector::from_vec(vec![1.0]))
            .unwrap();
        assert!(matches!(
            extract_volumes(&missing_link, &mut counts, &classes),
            Err(OdmeError::UnknownLinkInResults { link_id: 5 })
        ));

        let missing_column = LinkFlowTable::new(vec![5])
            .with_column("car_tot", DVector::from_vec(vec![1.0]))
            .unwrap();
        assert!(matches!(
            extract_volumes(&missing_column, &mut counts, &classes),
            Err(OdmeError::MissingFlowColumn { .. })
        ));
    }

    #[test]
    fn queries_are_keyed_by_observation() {
        let (_, counts) = setup();
        let queries = select_link_queries(&counts);
        let key = ObservationKey::new("car", 5, Direction::Forward);
        assert_eq!(queries[&key], vec![(5, Direction::Forward)]);
    }
}
