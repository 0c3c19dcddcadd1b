//! Boundary with the traffic-assignment procedure.
//!
//! The calibration never performs path finding itself. It drives an
//! [`AssignmentEngine`] through four calls: register the select-link queries once,
//! load each class's current demand, run a blocking full assignment, then read
//! back the select-link OD matrices and the per-link flow table.
//!
//! [`FixedRouteAssignment`] is a minimal engine whose route shares never change.
//! It is enough to drive the controller end to end and makes the cached volume
//! re-estimation exact.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector};

use crate::data::{Direction, LinkId, ObservationKey, UserClass};
use crate::error::{AssignmentError, OdmeError, Result};

/// Select-link queries keyed by the observation they serve.
pub type SelectLinkQueries = BTreeMap<ObservationKey, Vec<(LinkId, Direction)>>;

/// Contract the calibration controller requires from a traffic-assignment procedure.
pub trait AssignmentEngine {
    /// User classes in assignment order, with the demand they are currently loaded with.
    fn classes(&self) -> Vec<UserClass>;

    /// Registers select-link queries; called exactly once before the first assignment.
    fn register_select_links(
        &mut self,
        queries: &SelectLinkQueries,
    ) -> std::result::Result<(), AssignmentError>;

    /// Replaces the demand the named class will be assigned with.
    fn set_demand(
        &mut self,
        class: &str,
        demand: &DMatrix<f64>,
    ) -> std::result::Result<(), AssignmentError>;

    /// Runs a full assignment. Blocks until results are available.
    fn execute(&mut self) -> std::result::Result<(), AssignmentError>;

    /// OD sub-matrices of the flow crossing each registered query.
    fn select_link_results(&self) -> BTreeMap<ObservationKey, DMatrix<f64>>;

    /// Aggregate per-link flows of the last assignment.
    fn link_flow_results(&self) -> LinkFlowTable;
}

/// Per-link flow table with named `f64` columns, one row per link.
#[derive(Clone, Debug, Default)]
pub struct LinkFlowTable {
    link_ids: Vec<LinkId>,
    rows: HashMap<LinkId, usize>,
    columns: BTreeMap<String, DVector<f64>>,
}

impl LinkFlowTable {
    /// Creates an empty table over the given links.
    pub fn new(link_ids: Vec<LinkId>) -> Self {
        let rows = link_ids
            .iter()
            .enumerate()
            .map(|(row, link)| (*link, row))
            .collect();
        Self {
            link_ids,
            rows,
            columns: BTreeMap::new(),
        }
    }

    /// Adds or replaces a column. Values must be ordered like the link ids.
    pub fn with_column<S: Into<String>>(mut self, name: S, values: DVector<f64>) -> Result<Self> {
        self.insert_column(name, values)?;
        Ok(self)
    }

    /// Adds or replaces a column in place; `values` must have one entry per link.
    pub fn insert_column<S: Into<String>>(&mut self, name: S, values: DVector<f64>) -> Result<()> {
        if values.len() != self.link_ids.len() {
            return Err(OdmeError::dimension_mismatch(
                "link-flow column",
                self.link_ids.len(),
                values.len(),
            ));
        }
        self.columns.insert(name.into(), values);
        Ok(())
    }

    /// Links present in the table.
    pub fn link_ids(&self) -> &[LinkId] {
        &self.link_ids
    }

    /// Returns `true` if the table has a row for `link_id`.
    pub fn contains_link(&self, link_id: LinkId) -> bool {
        self.rows.contains_key(&link_id)
    }

    /// Returns `true` if the table has a column named `column`.
    pub fn contains_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Reads a single cell; `None` if either the link or the column is absent.
    pub fn value(&self, link_id: LinkId, column: &str) -> Option<f64> {
        let row = *self.rows.get(&link_id)?;
        self.columns.get(column).map(|values| values[row])
    }
}

/// One leg of a fixed route: the share of an OD cell's demand using a link in a direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RouteLeg {
    pub link_id: LinkId,
    /// [`Direction::Forward`] or [`Direction::Backward`].
    pub direction: Direction,
    pub share: f64,
}

impl RouteLeg {
    pub fn new(link_id: LinkId, direction: Direction, share: f64) -> Self {
        Self {
            link_id,
            direction,
            share,
        }
    }
}

#[derive(Clone, Debug)]
struct FixedRouteClass {
    class: UserClass,
    legs: HashMap<(usize, usize), Vec<RouteLeg>>,
}

/// Assignment engine whose route choice is a fixed set of link shares per OD cell.
#[derive(Clone, Debug, Default)]
pub struct FixedRouteAssignment {
    classes: Vec<FixedRouteClass>,
    links: Vec<LinkId>,
    queries: SelectLinkQueries,
    executions: usize,
    select_link: BTreeMap<ObservationKey, DMatrix<f64>>,
    flows: LinkFlowTable,
}

impl FixedRouteAssignment {
    /// Creates an engine over the given network links.
    pub fn new(links: Vec<LinkId>) -> Self {
        Self {
            flows: LinkFlowTable::new(links.clone()),
            links,
            ..Self::default()
        }
    }

    /// Adds a user class with no routes yet.
    pub fn with_class(mut self, class: UserClass) -> Self {
        self.classes.push(FixedRouteClass {
            class,
            legs: HashMap::new(),
        });
        self
    }

    /// Routes `share` of OD cell `(origin, destination)` of `class` over a link.
    ///
    /// The class must already be added and both zones must lie inside its demand matrix.
    pub fn with_leg(
        mut self,
        class: &str,
        origin: usize,
        destination: usize,
        leg: RouteLeg,
    ) -> Result<Self> {
        let entry = self
            .classes
            .iter_mut()
            .find(|entry| entry.class.name == class)
            .ok_or_else(|| OdmeError::UnknownClass {
                class: class.to_string(),
            })?;
        let zones = entry.class.demand.nrows().min(entry.class.demand.ncols());
        for zone in [origin, destination] {
            if zone >= zones {
                return Err(OdmeError::ZoneOutOfRange {
                    class: class.to_string(),
                    zone,
                    zones,
                });
            }
        }
        entry
            .legs
            .entry((origin, destination))
            .or_default()
            .push(leg);
        Ok(self)
    }

    /// Number of completed full assignments.
    pub fn executions(&self) -> usize {
        self.executions
    }

    /// Queries received through [`AssignmentEngine::register_select_links`].
    pub fn registered_queries(&self) -> &SelectLinkQueries {
        &self.queries
    }

    /// Demand currently loaded for the named class.
    pub fn demand(&self, class: &str) -> Option<&DMatrix<f64>> {
        self.classes
            .iter()
            .find(|entry| entry.class.name == class)
            .map(|entry| &entry.class.demand)
    }

    fn link_row(&self, link_id: LinkId) -> Option<usize> {
        self.links.iter().position(|link| *link == link_id)
    }
}

fn leg_matches(leg: &RouteLeg, link_id: LinkId, direction: Direction) -> bool {
    leg.link_id == link_id && (direction == Direction::Total || leg.direction == direction)
}

impl AssignmentEngine for FixedRouteAssignment {
    fn classes(&self) -> Vec<UserClass> {
        self.classes.iter().map(|entry| entry.class.clone()).collect()
    }

    fn register_select_links(
        &mut self,
        queries: &SelectLinkQueries,
    ) -> std::result::Result<(), AssignmentError> {
        self.queries = queries.clone();
        Ok(())
    }

    fn set_demand(
        &mut self,
        class: &str,
        demand: &DMatrix<f64>,
    ) -> std::result::Result<(), AssignmentError> {
        let entry = self
            .classes
            .iter_mut()
            .find(|entry| entry.class.name == class)
            .ok_or_else(|| format!("fixed-route assignment has no class `{class}`"))?;
        entry.class.demand = demand.clone();
        Ok(())
    }

    fn execute(&mut self) -> std::result::Result<(), AssignmentError> {
        let mut flows = LinkFlowTable::new(self.links.clone());
        let mut select_link = BTreeMap::new();

        for entry in &self.classes {
            let demand = &entry.class.demand;
            let mut ab = DVector::zeros(self.links.len());
            let mut ba = DVector::zeros(self.links.len());

            for (&(origin, destination), legs) in &entry.legs {
                let volume = *demand.get((origin, destination)).ok_or_else(|| {
                    format!(
                        "route ({origin}, {destination}) of class `{}` lies outside its {}x{} demand",
                        entry.class.name,
                        demand.nrows(),
                        demand.ncols()
                    )
                })?;
                for leg in legs {
                    let row = self
                        .link_row(leg.link_id)
                        .ok_or_else(|| format!("route uses unknown link {}", leg.link_id))?;
                    match leg.direction {
                        Direction::Forward => ab[row] += volume * leg.share,
                        Direction::Backward => ba[row] += volume * leg.share,
                        Direction::Total => {
                            return Err("route legs must be directed".into());
                        }
                    }
                }
            }

            let prefix = entry.class.flow_prefix.as_str();
            let total = &ab + &ba;
            flows.insert_column(Direction::Forward.column_name(prefix), ab)?;
            flows.insert_column(Direction::Backward.column_name(prefix), ba)?;
            flows.insert_column(Direction::Total.column_name(prefix), total)?;

            let class_queries = self
                .queries
                .iter()
                .filter(|(key, _)| key.class == entry.class.name);
            for (key, links) in class_queries {
                let mut matrix = DMatrix::zeros(demand.nrows(), demand.ncols());
                for (&(origin, destination), legs) in &entry.legs {
                    let share: f64 = legs
                        .iter()
                        .filter(|leg| {
                            links
                                .iter()
                                .any(|(link, direction)| leg_matches(leg, *link, *direction))
                        })
                        .map(|leg| leg.share)
                        .sum();
                    matrix[(origin, destination)] = demand[(origin, destination)] * share;
                }
                select_link.insert(key.clone(), matrix);
            }
        }

        self.flows = flows;
        self.select_link = select_link;
        self.executions += 1;
        Ok(())
    }

    fn select_link_results(&self) -> BTreeMap<ObservationKey, DMatrix<f64>> {
        self.select_link.clone()
    }

    fn link_flow_results(&self) -> LinkFlowTable {
        self.flows.clone()
    }
}
