//! Conditional attribute assignment
//!
//! Stamps a categorical attribute onto every unit of a population so that,
//! within each group (e.g. neighbourhood), realized counts follow a fitted
//! joint distribution conditioned on the attributes the units already have,
//! while also honoring group-level margins as closely as integers allow.
//!
//! Per group:
//! 1. conditioning attributes = joint dimensions every unit of the group has
//! 2. expected counts = conditional distribution × units per combination
//! 3. per-group IPF refinement against the margins that involve the target
//! 4. largest-remainder rounding per combination (exact row totals)
//! 5. corrective passes, one per margin, in registration order
//! 6. shuffled stamping of the allocated values onto the units
//!
//! Margin order is load-bearing: a later margin may undo part of the
//! correction made for an earlier one.

pub mod rounding;

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::config::AssignConfig;
use crate::error::{Result, SynthError};
use crate::fitting::{fit, Constraint};
use crate::population::{partition, Unit};
use crate::rng::{stream, stream_rng};
use crate::table::{CategoryRegistry, ContingencyTable, Key};

use rounding::{correct_towards, largest_remainder, MarginTarget};

/// A margin applied during assignment.
///
/// `table` either carries the group key as a dimension (one slice per group)
/// or not (the same distribution applies to every group, rescaled).
#[derive(Debug, Clone)]
struct AssignMargin<'a> {
    dims: Vec<String>,
    table: &'a ContingencyTable,
}

/// Final error of one margin in one group, after all correction passes.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginResidual {
    pub group: String,
    pub dims: Vec<String>,
    /// Sum of absolute differences between realized and integer target counts
    pub abs_error: u64,
    /// Single-unit moves made by this margin's correction pass
    pub moves: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssignReport {
    pub attribute: String,
    pub groups: usize,
    pub assigned: usize,
    /// (group, conditioning combination) pairs that had no mass in the joint
    pub uniform_fallbacks: Vec<(String, Key)>,
    pub margin_residuals: Vec<MarginResidual>,
}

impl AssignReport {
    pub fn total_margin_error(&self) -> u64 {
        self.margin_residuals.iter().map(|r| r.abs_error).sum()
    }
}

struct GroupAllocation {
    group: String,
    assignments: Vec<(usize, String)>,
    fallbacks: Vec<Key>,
    residuals: Vec<MarginResidual>,
}

pub struct ConditionalAttributeAssigner<'a> {
    joint: &'a ContingencyTable,
    target: String,
    group_key: String,
    margins: Vec<AssignMargin<'a>>,
    categories: Option<Vec<String>>,
    config: AssignConfig,
}

impl<'a> ConditionalAttributeAssigner<'a> {
    pub fn new(joint: &'a ContingencyTable, target: &str, group_key: &str) -> Self {
        Self {
            joint,
            target: target.to_string(),
            group_key: group_key.to_string(),
            margins: Vec::new(),
            categories: None,
            config: AssignConfig::default(),
        }
    }

    /// Register a margin over `dims` (group key excluded). Margins are
    /// corrected for in the order they are added.
    pub fn with_margin<S: AsRef<str>>(mut self, dims: &[S], table: &'a ContingencyTable) -> Self {
        self.margins.push(AssignMargin {
            dims: dims.iter().map(|d| d.as_ref().to_string()).collect(),
            table,
        });
        self
    }

    /// Take the target's category list from `registry` instead of the joint.
    pub fn with_categories(mut self, registry: &CategoryRegistry) -> Result<Self> {
        self.categories = Some(registry.categories(&self.target)?.to_vec());
        Ok(self)
    }

    pub fn with_config(mut self, config: AssignConfig) -> Self {
        self.config = config;
        self
    }

    /// Assign the target attribute to every unit.
    ///
    /// # Errors
    /// Configuration errors only: target missing from the joint, a unit
    /// already carrying the target, a unit without the group key, or a
    /// margin over attributes the group's units do not have.
    pub fn run<U: Unit + Sync>(&self, units: &mut [U]) -> Result<AssignReport> {
        self.joint.dim_index(&self.target)?;
        let categories = match &self.categories {
            Some(categories) => categories.clone(),
            None => self.joint.categories(&self.target)?,
        };
        if categories.is_empty() {
            return Err(SynthError::InvalidDistribution(format!(
                "no categories for '{}'",
                self.target
            )));
        }
        if let Some(unit) = units.iter().find(|u| u.attribute(&self.target).is_some()) {
            return Err(SynthError::AttributeAlreadySet {
                unit: unit.id().to_string(),
                attribute: self.target.clone(),
            });
        }

        let groups = partition(&*units, &self.group_key)?;
        let shared: &[U] = units;
        let mut allocations = if self.config.parallel {
            groups
                .par_iter()
                .map(|(group, members)| self.allocate_group(shared, group, members, &categories))
                .collect::<Result<Vec<_>>>()?
        } else {
            groups
                .iter()
                .map(|(group, members)| self.allocate_group(shared, group, members, &categories))
                .collect::<Result<Vec<_>>>()?
        };
        allocations.sort_by(|a, b| a.group.cmp(&b.group));

        let mut report = AssignReport {
            attribute: self.target.clone(),
            groups: allocations.len(),
            ..Default::default()
        };
        for allocation in allocations {
            for (idx, value) in allocation.assignments {
                units[idx].set_attribute(&self.target, value)?;
                report.assigned += 1;
            }
            report.uniform_fallbacks.extend(
                allocation
                    .fallbacks
                    .into_iter()
                    .map(|combo| (allocation.group.clone(), combo)),
            );
            report.margin_residuals.extend(allocation.residuals);
        }

        info!(
            "Assigned '{}' to {} units in {} groups (margin error {})",
            self.target,
            report.assigned,
            report.groups,
            report.total_margin_error()
        );
        Ok(report)
    }

    fn allocate_group<U: Unit>(
        &self,
        units: &[U],
        group: &str,
        members: &[usize],
        categories: &[String],
    ) -> Result<GroupAllocation> {
        let cond_dims: Vec<String> = self
            .joint
            .dims()
            .iter()
            .filter(|d| **d != self.target)
            .filter(|d| members.iter().all(|&i| units[i].attribute(d).is_some()))
            .cloned()
            .collect();
        let mut full_dims = cond_dims.clone();
        full_dims.push(self.target.clone());

        for margin in &self.margins {
            if let Some(dim) = margin.dims.iter().find(|d| !full_dims.contains(d)) {
                return Err(SynthError::UnknownDimension {
                    dimension: dim.clone(),
                    available: full_dims.clone(),
                });
            }
        }

        let mut combos: BTreeMap<Key, Vec<usize>> = BTreeMap::new();
        for &idx in members {
            let key = cond_dims
                .iter()
                .map(|d| units[idx].require(d).map(str::to_string))
                .collect::<Result<Key>>()?;
            combos.entry(key).or_default().push(idx);
        }
        let rows: Vec<&Key> = combos.keys().collect();
        let row_totals: Vec<u64> = combos.values().map(|m| m.len() as u64).collect();
        let group_total: u64 = row_totals.iter().sum();

        // Conditional distribution per combination
        let conditional = self.joint.project(&full_dims)?;
        let mut fallbacks = Vec::new();
        let mut expected: Vec<Vec<f64>> = Vec::with_capacity(rows.len());
        for (row, &n) in rows.iter().zip(&row_totals) {
            let weights: Vec<f64> = categories
                .iter()
                .map(|c| conditional.get(&cell_key(row, c)))
                .collect();
            let mass: f64 = weights.iter().sum();
            if mass > 0.0 {
                expected.push(weights.iter().map(|w| w * n as f64 / mass).collect());
            } else {
                warn!(
                    "No mass for {:?} = {:?} in group {}; assigning '{}' uniformly",
                    cond_dims, row, group, self.target
                );
                fallbacks.push((*row).clone());
                expected.push(vec![n as f64 / categories.len() as f64; categories.len()]);
            }
        }

        // Group slices of the margins that involve the target, scaled to the group
        let mut target_margins = Vec::new();
        for margin in &self.margins {
            if !margin.dims.contains(&self.target) {
                debug!(
                    "Margin {:?} only constrains conditioning attributes; skipped",
                    margin.dims
                );
                continue;
            }
            if let Some(table) = self.margin_for_group(margin, group, &full_dims, categories, &rows)? {
                target_margins.push((margin, table.scaled(group_total as f64 / table.total())));
            }
        }

        if !target_margins.is_empty() {
            expected = self.refine(&cond_dims, &full_dims, &rows, &row_totals, categories, expected, &target_margins)?;
        }

        let mut counts: Vec<Vec<u64>> = expected
            .iter()
            .zip(&row_totals)
            .map(|(e, &n)| largest_remainder(e, n))
            .collect();

        let mut plans = Vec::with_capacity(target_margins.len());
        let mut moves = Vec::with_capacity(target_margins.len());
        for (margin, table) in &target_margins {
            let plan = margin_target(&full_dims, &margin.dims, table, &rows, categories, group_total);
            moves.push(correct_towards(
                &mut counts,
                &expected,
                &plan,
                self.config.max_correction_moves,
            ));
            plans.push(plan);
        }
        let residuals = target_margins
            .iter()
            .zip(&plans)
            .zip(moves)
            .map(|(((margin, _), plan), moves)| MarginResidual {
                group: group.to_string(),
                dims: margin.dims.clone(),
                abs_error: plan.abs_error(&counts),
                moves,
            })
            .collect();

        let stream_name = format!("{}:{}", stream::ASSIGN, self.target);
        let mut rng = stream_rng(self.config.seed, &stream_name, group);
        let mut assignments = Vec::with_capacity(members.len());
        for ((_, members), row_counts) in combos.iter().zip(&counts) {
            let mut labels: Vec<&String> = categories
                .iter()
                .zip(row_counts)
                .flat_map(|(c, &n)| std::iter::repeat(c).take(n as usize))
                .collect();
            labels.shuffle(&mut rng);
            assignments.extend(members.iter().zip(labels).map(|(&i, c)| (i, c.clone())));
        }

        Ok(GroupAllocation {
            group: group.to_string(),
            assignments,
            fallbacks,
            residuals,
        })
    }

    /// This group's slice of `margin`, restricted to categories the group can
    /// realize. `None` when the slice is empty.
    fn margin_for_group(
        &self,
        margin: &AssignMargin<'_>,
        group: &str,
        full_dims: &[String],
        categories: &[String],
        rows: &[&Key],
    ) -> Result<Option<ContingencyTable>> {
        let slice = if margin.table.has_dim(&self.group_key) {
            margin.table.select(&self.group_key, group)?
        } else {
            margin.table.clone()
        };
        let slice = slice.project(&margin.dims)?;

        let positions: Vec<usize> = margin
            .dims
            .iter()
            .filter_map(|d| full_dims.iter().position(|f| f == d))
            .collect();
        let target_pos = full_dims.len() - 1;
        let restricted = slice.filter(|key| {
            key.iter().zip(&positions).all(|(value, &pos)| {
                if pos == target_pos {
                    categories.contains(value)
                } else {
                    rows.iter().any(|row| &row[pos] == value)
                }
            })
        });

        if restricted.total() <= 0.0 {
            debug!("Margin {:?} has no mass in group {}", margin.dims, group);
            return Ok(None);
        }
        Ok(Some(restricted))
    }

    /// Per-group IPF of the expected counts against the target margins, with
    /// the combination totals applied last so they hold exactly.
    #[allow(clippy::too_many_arguments)]
    fn refine(
        &self,
        cond_dims: &[String],
        full_dims: &[String],
        rows: &[&Key],
        row_totals: &[u64],
        categories: &[String],
        expected: Vec<Vec<f64>>,
        margins: &[(&AssignMargin<'_>, ContingencyTable)],
    ) -> Result<Vec<Vec<f64>>> {
        let mut seed = ContingencyTable::new(full_dims.iter().cloned())?;
        for (row, values) in rows.iter().zip(&expected) {
            for (category, &value) in categories.iter().zip(values) {
                seed.set(cell_key(row, category), value)?;
            }
        }

        let mut constraints: Vec<Constraint> = margins
            .iter()
            .map(|(_, table)| Constraint::from_margin(table.clone()))
            .collect();
        let row_table = ContingencyTable::from_rows(
            cond_dims.iter().cloned(),
            rows.iter().zip(row_totals).map(|(r, &n)| ((*r).clone(), n as f64)),
        )?;
        constraints.push(Constraint::from_margin(row_table));

        let outcome = fit(&seed, &constraints, &self.config.refinement)?;
        Ok(rows
            .iter()
            .map(|row| {
                categories
                    .iter()
                    .map(|c| outcome.table.get(&cell_key(row, c)))
                    .collect()
            })
            .collect())
    }
}

fn cell_key(row: &Key, category: &str) -> Key {
    let mut key = row.clone();
    key.push(category.to_string());
    key
}

/// Integer targets for one margin and the (row, column) → margin cell map.
fn margin_target(
    full_dims: &[String],
    margin_dims: &[String],
    table: &ContingencyTable,
    rows: &[&Key],
    categories: &[String],
    group_total: u64,
) -> MarginTarget {
    let positions: Vec<usize> = margin_dims
        .iter()
        .filter_map(|d| full_dims.iter().position(|f| f == d))
        .collect();
    let target_pos = full_dims.len() - 1;

    let mut index: BTreeMap<Key, usize> = BTreeMap::new();
    let mut values: Vec<f64> = Vec::new();
    for (key, value) in table.iter() {
        index.insert(key.clone(), values.len());
        values.push(value);
    }

    let cell_of = rows
        .iter()
        .map(|row| {
            categories
                .iter()
                .map(|category| {
                    let key: Key = positions
                        .iter()
                        .map(|&p| if p == target_pos { category.clone() } else { row[p].clone() })
                        .collect();
                    let next = values.len();
                    *index.entry(key).or_insert_with(|| {
                        values.push(0.0);
                        next
                    })
                })
                .collect()
        })
        .collect();

    MarginTarget {
        cell_of,
        targets: largest_remainder(&values, group_total),
    }
}
