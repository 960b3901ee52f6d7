//! Joint distribution fitting (iterative proportional fitting)
//!
//! Rescales a seed contingency table until each of its projections matches a
//! target margin. Margins may come from different sources and disagree on
//! their grand totals; in that case the fitter returns the best table it
//! reached and reports the residual deviation instead of failing.
//!
//! Cells that are zero in the seed stay zero: a multiplicative update cannot
//! create mass in a structural zero.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

use crate::config::FitConfig;
use crate::error::{Result, SynthError};
use crate::table::{ContingencyTable, Key};

/// A target margin over a subset of the seed's dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    margin: ContingencyTable,
}

impl Constraint {
    /// Project `margin` onto `dims`. The margin may carry extra dimensions
    /// (e.g. a per-neighbourhood table used as a municipality-wide total).
    pub fn new<S: AsRef<str>>(dims: &[S], margin: &ContingencyTable) -> Result<Self> {
        Ok(Self {
            margin: margin.project(dims)?,
        })
    }

    /// Use every dimension of `margin`.
    pub fn from_margin(margin: ContingencyTable) -> Self {
        Self { margin }
    }

    pub fn dims(&self) -> &[String] {
        self.margin.dims()
    }

    pub fn margin(&self) -> &ContingencyTable {
        &self.margin
    }

    /// Drop margin rows whose categories do not occur in `seed`.
    ///
    /// A margin can mention categories the seed never realized (the synthetic
    /// population never produced them); the projection comparison is
    /// ill-defined for those rows. Returns the trimmed constraint and the
    /// number of rows removed.
    pub fn restricted_to(&self, seed: &ContingencyTable) -> Result<(Self, usize)> {
        let mut margin = self.margin.clone();
        let mut removed = 0;
        for dim in self.margin.dims() {
            let allowed: BTreeSet<String> = seed.categories(dim)?.into_iter().collect();
            removed += margin.retain_categories(dim, &allowed)?;
        }
        Ok((Self { margin }, removed))
    }
}

/// Result of a fit, converged or not.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub table: ContingencyTable,
    /// Full sweeps performed
    pub iterations: usize,
    /// Largest relative deviation of any reachable projection cell
    pub max_deviation: f64,
    pub converged: bool,
    /// Projection cells with a positive target but no seed mass to scale
    pub unreachable_cells: usize,
}

/// Precomputed cell → projection mapping for one constraint.
struct ConstraintPlan {
    cell_to_proj: Vec<usize>,
    targets: Vec<f64>,
}

/// Fit `seed` to `constraints`, applied in the given order each sweep.
///
/// # Errors
/// * `UnknownDimension` if a constraint references a dimension the seed lacks
/// * `UnknownCategory` if a margin row uses a category absent from the seed
///   (trim with [`Constraint::restricted_to`] first)
pub fn fit(
    seed: &ContingencyTable,
    constraints: &[Constraint],
    config: &FitConfig,
) -> Result<FitOutcome> {
    let keys: Vec<Key> = seed.iter().map(|(k, _)| k.clone()).collect();
    let mut cells: Vec<f64> = seed.iter().map(|(_, v)| v).collect();

    let plans = constraints
        .iter()
        .map(|c| plan_constraint(seed, &keys, c))
        .collect::<Result<Vec<_>>>()?;

    if plans.is_empty() {
        return Ok(FitOutcome {
            table: seed.clone(),
            iterations: 0,
            max_deviation: 0.0,
            converged: true,
            unreachable_cells: 0,
        });
    }

    let mut iterations = 0;
    let mut max_deviation = deviation(&cells, &plans).0;
    let mut converged = max_deviation < config.tolerance;

    while !converged && iterations < config.max_iterations {
        for plan in &plans {
            let current = projection_sums(&cells, plan);
            let factors: Vec<f64> = current
                .iter()
                .zip(&plan.targets)
                .map(|(&cur, &target)| if cur > 0.0 { target / cur } else { 1.0 })
                .collect();
            for (cell, &p) in cells.iter_mut().zip(&plan.cell_to_proj) {
                *cell *= factors[p];
            }
        }
        iterations += 1;

        let previous = max_deviation;
        max_deviation = deviation(&cells, &plans).0;
        if iterations % 1_000 == 0 {
            debug!("IPF iteration {}: max deviation {:.3e}", iterations, max_deviation);
        }

        if max_deviation < config.tolerance {
            converged = true;
        } else if (previous - max_deviation).abs() < config.stall_tolerance {
            debug!("IPF stalled after {} iterations", iterations);
            break;
        }
    }

    let unreachable_cells = deviation(&cells, &plans).1;
    if converged {
        info!(
            "IPF converged after {} iterations (max deviation {:.3e})",
            iterations, max_deviation
        );
    } else {
        warn!(
            "IPF did not reach tolerance {:.1e} after {} iterations (max deviation {:.3e})",
            config.tolerance, iterations, max_deviation
        );
    }
    if unreachable_cells > 0 {
        warn!(
            "IPF: {} margin cells have a positive target but zero seed mass",
            unreachable_cells
        );
    }

    let mut table = ContingencyTable::new(seed.dims().iter().cloned())?;
    for (key, value) in keys.into_iter().zip(cells) {
        table.set(key, value)?;
    }

    Ok(FitOutcome {
        table,
        iterations,
        max_deviation,
        converged,
        unreachable_cells,
    })
}

fn plan_constraint(
    seed: &ContingencyTable,
    keys: &[Key],
    constraint: &Constraint,
) -> Result<ConstraintPlan> {
    let indices = seed.dim_indices(constraint.dims())?;

    for (pos, &seed_idx) in indices.iter().enumerate() {
        let dim = &seed.dims()[seed_idx];
        let known: BTreeSet<String> = seed.categories(dim)?.into_iter().collect();
        for (key, _) in constraint.margin().iter() {
            if !known.contains(&key[pos]) {
                return Err(SynthError::UnknownCategory {
                    dimension: dim.clone(),
                    category: key[pos].clone(),
                });
            }
        }
    }

    let mut proj_index: BTreeMap<Key, usize> = BTreeMap::new();
    let mut targets = Vec::new();
    let mut cell_to_proj = Vec::with_capacity(keys.len());
    for key in keys {
        let sub: Key = indices.iter().map(|&i| key[i].clone()).collect();
        let next = proj_index.len();
        let p = *proj_index.entry(sub.clone()).or_insert_with(|| {
            targets.push(constraint.margin().get(&sub));
            next
        });
        cell_to_proj.push(p);
    }

    // Margin rows with no seed cell at all can never be matched; keep them
    // as empty projections so they are counted as unreachable.
    for (key, target) in constraint.margin().iter() {
        if !proj_index.contains_key(key) {
            proj_index.insert(key.clone(), targets.len());
            targets.push(target);
        }
    }

    Ok(ConstraintPlan {
        cell_to_proj,
        targets,
    })
}

fn projection_sums(cells: &[f64], plan: &ConstraintPlan) -> Vec<f64> {
    let mut sums = vec![0.0; plan.targets.len()];
    for (cell, &p) in cells.iter().zip(&plan.cell_to_proj) {
        sums[p] += cell;
    }
    sums
}

/// (max relative deviation over reachable cells, unreachable cell count)
fn deviation(cells: &[f64], plans: &[ConstraintPlan]) -> (f64, usize) {
    let mut max_dev: f64 = 0.0;
    let mut unreachable = 0;
    for plan in plans {
        for (cur, &target) in projection_sums(cells, plan).into_iter().zip(&plan.targets) {
            if target > 0.0 {
                if cur > 0.0 {
                    max_dev = max_dev.max((cur - target).abs() / target);
                } else {
                    unreachable += 1;
                }
            } else if cur > 0.0 {
                max_dev = max_dev.max(1.0);
            }
        }
    }
    (max_dev, unreachable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_flags() -> ContingencyTable {
        ContingencyTable::from_rows(
            ["group", "flag"],
            [
                (vec!["A", "true"], 40.0),
                (vec!["A", "false"], 10.0),
                (vec!["B", "true"], 20.0),
                (vec!["B", "false"], 30.0),
            ],
        )
        .unwrap()
    }

    fn margin(dim: &str, rows: &[(&str, f64)]) -> Constraint {
        Constraint::from_margin(
            ContingencyTable::from_rows([dim], rows.iter().map(|(k, v)| (vec![*k], *v))).unwrap(),
        )
    }

    #[test]
    fn test_fit_matches_single_margin() {
        let outcome = fit(
            &seed_flags(),
            &[margin("flag", &[("true", 55.0), ("false", 45.0)])],
            &FitConfig::default(),
        )
        .unwrap();
        assert!(outcome.converged);
        let flags = outcome.table.project(&["flag"]).unwrap();
        assert!((flags.get(&["true"]) - 55.0).abs() < 1e-6);
        assert!((flags.get(&["false"]) - 45.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_two_margins() {
        let outcome = fit(
            &seed_flags(),
            &[
                margin("flag", &[("true", 55.0), ("false", 45.0)]),
                margin("group", &[("A", 50.0), ("B", 50.0)]),
            ],
            &FitConfig::default(),
        )
        .unwrap();
        assert!(outcome.converged);
        let groups = outcome.table.project(&["group"]).unwrap();
        let flags = outcome.table.project(&["flag"]).unwrap();
        assert!((groups.get(&["A"]) - 50.0).abs() < 1e-4);
        assert!((flags.get(&["true"]) - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_fit_identity_when_already_consistent() {
        let seed = seed_flags();
        let outcome = fit(
            &seed,
            &[
                margin("flag", &[("true", 60.0), ("false", 40.0)]),
                margin("group", &[("A", 50.0), ("B", 50.0)]),
            ],
            &FitConfig::default(),
        )
        .unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
        for (key, value) in seed.iter() {
            assert!((outcome.table.get(key) - value).abs() < 1e-9);
        }
    }

    #[test]
    fn test_zero_cells_stay_zero() {
        let seed = ContingencyTable::from_rows(
            ["group", "flag"],
            [
                (vec!["A", "true"], 0.0),
                (vec!["A", "false"], 10.0),
                (vec!["B", "true"], 20.0),
                (vec!["B", "false"], 30.0),
            ],
        )
        .unwrap();
        let outcome = fit(
            &seed,
            &[
                margin("flag", &[("true", 50.0), ("false", 50.0)]),
                margin("group", &[("A", 30.0), ("B", 70.0)]),
            ],
            &FitConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.table.get(&["A", "true"]), 0.0);
    }

    #[test]
    fn test_inconsistent_margins_return_best_effort() {
        let outcome = fit(
            &seed_flags(),
            &[
                margin("flag", &[("true", 55.0), ("false", 45.0)]),
                margin("group", &[("A", 80.0), ("B", 80.0)]),
            ],
            &FitConfig::default(),
        )
        .unwrap();
        assert!(!outcome.converged);
        assert!(outcome.max_deviation > 0.1);
        // The last constraint applied in a sweep is met exactly
        let groups = outcome.table.project(&["group"]).unwrap();
        assert!((groups.get(&["A"]) - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_dimension_is_fatal() {
        let err = fit(
            &seed_flags(),
            &[margin("income", &[("high", 1.0)])],
            &FitConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SynthError::UnknownDimension { .. }));
    }

    #[test]
    fn test_unknown_category_is_fatal_until_restricted() {
        let constraint = margin("flag", &[("true", 55.0), ("false", 45.0), ("maybe", 3.0)]);
        let err = fit(&seed_flags(), &[constraint.clone()], &FitConfig::default()).unwrap_err();
        assert!(matches!(err, SynthError::UnknownCategory { .. }));

        let (trimmed, removed) = constraint.restricted_to(&seed_flags()).unwrap();
        assert_eq!(removed, 1);
        assert!(fit(&seed_flags(), &[trimmed], &FitConfig::default()).unwrap().converged);
    }

    #[test]
    fn test_constraint_projects_richer_margin() {
        let per_group = ContingencyTable::from_rows(
            ["neighb_code", "flag"],
            [
                (vec!["BU01", "true"], 30.0),
                (vec!["BU02", "true"], 25.0),
                (vec!["BU01", "false"], 45.0),
            ],
        )
        .unwrap();
        let constraint = Constraint::new(&["flag"], &per_group).unwrap();
        assert_eq!(constraint.margin().get(&["true"]), 55.0);
    }

    #[test]
    fn test_unreachable_cells_reported() {
        let seed = ContingencyTable::from_rows(
            ["group", "flag"],
            [(vec!["A", "true"], 0.0), (vec!["A", "false"], 10.0)],
        )
        .unwrap();
        let outcome = fit(
            &seed,
            &[margin("flag", &[("true", 5.0), ("false", 5.0)])],
            &FitConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.unreachable_cells, 1);
        assert!(outcome.converged);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: zero seed cells remain zero for any positive margins
            #[test]
            fn prop_zero_cells_preserved(
                cells in proptest::collection::vec(prop_oneof![Just(0.0f64), 0.5f64..50.0], 9),
                rows in proptest::collection::vec(1.0f64..100.0, 3),
                cols in proptest::collection::vec(1.0f64..100.0, 3),
            ) {
                let labels = ["a", "b", "c"];
                let seed = ContingencyTable::from_rows(
                    ["r", "c"],
                    (0..9).map(|i| (vec![labels[i / 3], labels[i % 3]], cells[i])),
                ).unwrap();
                let row_total: f64 = rows.iter().sum();
                let col_total: f64 = cols.iter().sum();
                let r = ContingencyTable::from_rows(["r"], (0..3).map(|i| (vec![labels[i]], rows[i]))).unwrap();
                let c = ContingencyTable::from_rows(
                    ["c"],
                    (0..3).map(|i| (vec![labels[i]], cols[i] * row_total / col_total)),
                ).unwrap();
                let config = FitConfig { max_iterations: 200, ..FitConfig::default() };
                let outcome = fit(&seed, &[Constraint::from_margin(r), Constraint::from_margin(c)], &config).unwrap();
                for (key, value) in seed.iter() {
                    if value == 0.0 {
                        prop_assert_eq!(outcome.table.get(key), 0.0);
                    }
                    prop_assert!(outcome.table.get(key).is_finite());
                }
            }

            /// Property: fitting to the seed's own projections is the identity
            #[test]
            fn prop_fixed_point(cells in proptest::collection::vec(0.0f64..50.0, 6)) {
                let labels = ["a", "b", "c"];
                let seed = ContingencyTable::from_rows(
                    ["r", "c"],
                    (0..6).map(|i| (vec![labels[i / 3], labels[i % 3]], cells[i])),
                ).unwrap();
                let constraints = [
                    Constraint::new(&["r"], &seed).unwrap(),
                    Constraint::new(&["c"], &seed).unwrap(),
                ];
                let outcome = fit(&seed, &constraints, &FitConfig::default()).unwrap();
                for (key, value) in seed.iter() {
                    prop_assert!((outcome.table.get(key) - value).abs() < 1e-6);
                }
            }
        }
    }
}
