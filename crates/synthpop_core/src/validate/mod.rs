//! Goodness-of-fit scoring
//!
//! Observed counts (a crosstab of the synthetic population, or a fitted
//! joint) are compared with expected counts projected onto the same
//! dimensions. The score is the continuity-corrected Z² statistic of Voas &
//! Williamson, tested against a chi-square critical value from the
//! Wilson–Hilferty approximation; SRMSE and total absolute error are reported
//! alongside.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;
use crate::error::{Result, SynthError};
use crate::fitting::{Constraint, FitOutcome};
use crate::population::{crosstab, Unit};
use crate::table::{ContingencyTable, Key};

/// One compared cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDeviation {
    pub key: Key,
    pub observed: f64,
    /// Expected count after scaling to the observed total and flooring
    pub expected: f64,
    pub z_squared: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub context: String,
    pub dims: Vec<String>,
    pub z_squared: f64,
    pub degrees_of_freedom: usize,
    pub critical_value: f64,
    pub passed: bool,
    /// Standardized root mean square error
    pub srmse: f64,
    pub total_abs_error: f64,
    /// Cells with observed or expected mass
    pub cells: usize,
    pub worst_cell: Option<CellDeviation>,
}

#[derive(Debug, Clone, Default)]
pub struct FitValidator {
    config: ValidationConfig,
}

impl FitValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Compare `observed` with `expected`, both projected onto `dims`.
    ///
    /// # Errors
    /// `UnknownDimension` if either table lacks one of `dims`; `FitRejected`
    /// for a failed fit in strict mode.
    pub fn validate<S: AsRef<str>>(
        &self,
        observed: &ContingencyTable,
        expected: &ContingencyTable,
        dims: &[S],
        context: &str,
    ) -> Result<FitReport> {
        let observed = observed.project(dims)?;
        let expected = expected.project(dims)?;
        let report = self.score(&observed, &expected, context);

        info!(
            "Fit {} over {:?}: Z² {:.3} (critical {:.3}, df {}), SRMSE {:.4}",
            context, report.dims, report.z_squared, report.critical_value, report.degrees_of_freedom, report.srmse
        );
        if !report.passed {
            if self.config.strict {
                return Err(SynthError::FitRejected {
                    context: context.to_string(),
                    z_squared: report.z_squared,
                    critical: report.critical_value,
                });
            }
            warn!(
                "Fit {} fails: Z² {:.3} exceeds {:.3}",
                context, report.z_squared, report.critical_value
            );
        }
        Ok(report)
    }

    /// Score a synthetic population against an expected table.
    pub fn validate_population<U: Unit, S: AsRef<str>>(
        &self,
        units: &[U],
        expected: &ContingencyTable,
        dims: &[S],
        context: &str,
    ) -> Result<FitReport> {
        let observed = crosstab(units, dims, None)?;
        self.validate(&observed, expected, dims, context)
    }

    /// Score how closely a fitted joint reproduces one of its constraints.
    pub fn validate_fitted(&self, outcome: &FitOutcome, constraint: &Constraint, context: &str) -> Result<FitReport> {
        self.validate(&outcome.table, constraint.margin(), constraint.dims(), context)
    }

    fn score(&self, observed: &ContingencyTable, expected: &ContingencyTable, context: &str) -> FitReport {
        let total = observed.total();
        let expected_total = expected.total();
        let scale = if expected_total > 0.0 { total / expected_total } else { 0.0 };

        let mut keys: Vec<&Key> = observed.iter().map(|(k, _)| k).collect();
        keys.extend(expected.iter().map(|(k, _)| k));
        keys.sort();
        keys.dedup();

        let mut cells = Vec::with_capacity(keys.len());
        for key in keys {
            let o = observed.get(key);
            let mut e = expected.get(key) * scale;
            if e < self.config.expected_floor {
                e = 0.0;
            }
            if o <= 0.0 && e <= 0.0 {
                continue;
            }
            cells.push(CellDeviation {
                key: key.clone(),
                observed: o,
                expected: e,
                z_squared: z_squared(o, e, total),
            });
        }

        let n = cells.len();
        let z_sum: f64 = cells.iter().map(|c| c.z_squared).sum();
        let total_abs_error: f64 = cells.iter().map(|c| (c.observed - c.expected).abs()).sum();
        let srmse = if n > 0 && total > 0.0 {
            let mse = cells.iter().map(|c| (c.observed - c.expected).powi(2)).sum::<f64>() / n as f64;
            mse.sqrt() / (total / n as f64)
        } else {
            0.0
        };
        let degrees_of_freedom = n.saturating_sub(1).max(1);
        let critical_value = chi_square_critical(degrees_of_freedom, self.config.z_critical);
        let worst_cell = cells
            .iter()
            .max_by(|a, b| a.z_squared.total_cmp(&b.z_squared))
            .cloned();

        FitReport {
            context: context.to_string(),
            dims: observed.dims().to_vec(),
            z_squared: z_sum,
            degrees_of_freedom,
            critical_value,
            passed: z_sum <= critical_value,
            srmse,
            total_abs_error,
            cells: n,
            worst_cell,
        }
    }
}

/// Continuity-corrected Z² of one cell.
///
/// Proportions are taken over the observed total; a zero expected proportion
/// is replaced by half a unit.
fn z_squared(observed: f64, expected: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    let p = if expected > 0.0 { expected / total } else { 0.5 / total };
    let variance = p * (1.0 - p) / total;
    if variance <= 0.0 {
        return 0.0;
    }
    let corrected = ((observed - expected).abs() - 0.5).max(0.0) / total;
    corrected * corrected / variance
}

/// Wilson–Hilferty approximation of the chi-square quantile for `df` degrees
/// of freedom at standard normal quantile `z`.
pub fn chi_square_critical(df: usize, z: f64) -> f64 {
    let k = df.max(1) as f64;
    let h = 2.0 / (9.0 * k);
    k * (1.0 - h + z * h.sqrt()).powi(3)
}

/// One scored comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub attribute: String,
    pub context: String,
    pub report: FitReport,
}

/// Collected fit reports for the final report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    rows: Vec<ScoreRow>,
}

impl Scorecard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, attribute: &str, report: FitReport) {
        self.rows.push(ScoreRow {
            attribute: attribute.to_string(),
            context: report.context.clone(),
            report,
        });
    }

    pub fn rows(&self) -> &[ScoreRow] {
        &self.rows
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScoreRow> {
        self.rows.iter().filter(|r| !r.report.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitConfig;
    use crate::fitting::fit;

    fn table(rows: &[(&str, f64)]) -> ContingencyTable {
        ContingencyTable::from_rows(["gender"], rows.iter().map(|(k, v)| (vec![*k], *v))).unwrap()
    }

    #[test]
    fn test_perfect_fit() {
        let observed = table(&[("female", 52.0), ("male", 48.0)]);
        let report = FitValidator::default()
            .validate(&observed, &observed, &["gender"], "gender")
            .unwrap();
        assert_eq!(report.z_squared, 0.0);
        assert_eq!(report.srmse, 0.0);
        assert!(report.passed);
        assert_eq!(report.cells, 2);
        assert_eq!(report.degrees_of_freedom, 1);
    }

    #[test]
    fn test_expected_scaled_to_observed_total() {
        let observed = table(&[("female", 52.0), ("male", 48.0)]);
        let shares = table(&[("female", 0.52), ("male", 0.48)]);
        let report = FitValidator::default()
            .validate(&observed, &shares, &["gender"], "gender")
            .unwrap();
        assert!(report.z_squared < 1e-12);
        assert!(report.total_abs_error < 1e-9);
    }

    #[test]
    fn test_continuity_correction_absorbs_rounding() {
        let observed = table(&[("female", 50.0), ("male", 50.0)]);
        let expected = table(&[("female", 50.4), ("male", 49.6)]);
        let report = FitValidator::default()
            .validate(&observed, &expected, &["gender"], "gender")
            .unwrap();
        assert_eq!(report.z_squared, 0.0);
    }

    #[test]
    fn test_floor_treats_negligible_expected_as_zero() {
        let observed = table(&[("female", 60.0), ("male", 40.0)]);
        let expected = table(&[("female", 60.0), ("male", 40.0), ("other", 0.001)]);
        let report = FitValidator::default()
            .validate(&observed, &expected, &["gender"], "gender")
            .unwrap();
        assert_eq!(report.cells, 2);
    }

    #[test]
    fn test_bad_fit_fails_and_strict_rejects() {
        let observed = table(&[("female", 90.0), ("male", 10.0), ("other", 0.0)]);
        let expected = table(&[("female", 50.0), ("male", 40.0), ("other", 10.0)]);
        let report = FitValidator::default()
            .validate(&observed, &expected, &["gender"], "gender")
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.cells, 3);
        assert_eq!(report.worst_cell.as_ref().map(|c| c.key.clone()), Some(vec!["female".to_string()]));

        let strict = FitValidator::new(ValidationConfig {
            strict: true,
            ..ValidationConfig::default()
        });
        let err = strict.validate(&observed, &expected, &["gender"], "gender").unwrap_err();
        assert!(matches!(err, SynthError::FitRejected { .. }));
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_wilson_hilferty_close_to_tables() {
        // chi2(0.95, 10) = 18.307, chi2(0.95, 30) = 43.773
        assert!((chi_square_critical(10, 1.645) - 18.307).abs() < 0.1);
        assert!((chi_square_critical(30, 1.645) - 43.773).abs() < 0.1);
    }

    #[test]
    fn test_validate_fitted_and_scorecard() {
        let seed = ContingencyTable::from_rows(
            ["group", "flag"],
            [
                (vec!["A", "true"], 40.0),
                (vec!["A", "false"], 10.0),
                (vec!["B", "true"], 20.0),
                (vec!["B", "false"], 30.0),
            ],
        )
        .unwrap();
        let margin = ContingencyTable::from_rows(["flag"], [(vec!["true"], 55.0), (vec!["false"], 45.0)]).unwrap();
        let constraint = Constraint::from_margin(margin);
        let outcome = fit(&seed, std::slice::from_ref(&constraint), &FitConfig::default()).unwrap();

        let validator = FitValidator::default();
        let report = validator.validate_fitted(&outcome, &constraint, "flag margin").unwrap();
        assert!(report.passed);

        let mut scorecard = Scorecard::new();
        scorecard.record("flag", report);
        let bad = validator
            .validate(&table(&[("female", 90.0), ("male", 10.0)]), &table(&[("female", 1.0), ("male", 1.0)]), &["gender"], "gender")
            .unwrap();
        scorecard.record("gender", bad);
        assert_eq!(scorecard.len(), 2);
        assert!(!scorecard.all_passed());
        assert_eq!(scorecard.failures().count(), 1);
    }
}
