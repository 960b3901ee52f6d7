//! Table ingestion and CSV export
//!
//! CSV (long format: one column per dimension plus a count column)
//! → ContingencyTable. Column names are mapped to dimension names explicitly
//! through [`TableSource::columns`]; nothing is renamed implicitly.
//!
//! Malformed rows are skipped with a warning on stderr and counted in
//! [`ParseStats`]; an unreadable file or a missing column is an error.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use synthpop_core::household::{AgeGapBin, AgeGapDistribution, GenderPair, GenderPairing, MemberSpec};
use synthpop_core::{Agent, ContingencyTable, Household, HouseholdCatalog, HouseholdType, Scorecard, Unit};

/// Where and how to read one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSource {
    pub path: PathBuf,
    /// Dimension names, in key order. Empty means every non-count column.
    #[serde(default)]
    pub dims: Vec<String>,
    #[serde(default = "default_count_column")]
    pub count_column: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Dimension name → CSV column header, for headers that differ
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

fn default_count_column() -> String {
    "count".to_string()
}

fn default_delimiter() -> char {
    ','
}

impl TableSource {
    pub fn new(path: impl Into<PathBuf>, dims: &[&str]) -> Self {
        Self {
            path: path.into(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            count_column: default_count_column(),
            delimiter: default_delimiter(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_count_column(mut self, column: &str) -> Self {
        self.count_column = column.to_string();
        self
    }

    pub fn with_column(mut self, dim: &str, header: &str) -> Self {
        self.columns.insert(dim.to_string(), header.to_string());
        self
    }

    /// Same source with a relative path resolved against `base`.
    pub fn resolved(&self, base: &Path) -> Self {
        let mut source = self.clone();
        source.path = resolve(base, &self.path);
        source
    }

    fn header_for<'a>(&'a self, dim: &'a str) -> &'a str {
        self.columns.get(dim).map_or(dim, |h| h.as_str())
    }
}

pub(crate) fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// CSV parsing statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseStats {
    pub total_rows: u32,
    pub parsed: u32,
    pub failed: u32,
}

fn open_reader(path: &Path, delimiter: char) -> Result<csv::Reader<fs::File>> {
    if !delimiter.is_ascii() {
        anyhow::bail!("Delimiter '{}' is not a single byte", delimiter);
    }
    csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter as u8)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))
}

fn header_index(reader: &mut csv::Reader<fs::File>, path: &Path) -> Result<FxHashMap<String, usize>> {
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read CSV header: {}", path.display()))?;
    Ok(headers
        .iter()
        .enumerate()
        .map(|(idx, h)| (h.trim_start_matches('\u{feff}').to_string(), idx))
        .collect())
}

fn column(index: &FxHashMap<String, usize>, name: &str, path: &Path) -> Result<usize> {
    index
        .get(name)
        .copied()
        .with_context(|| format!("Column '{}' not found in {}", name, path.display()))
}

/// Read a long-format CSV into a ContingencyTable.
///
/// # Returns
///
/// * `Ok((ContingencyTable, ParseStats))` - Table and row statistics
/// * `Err(anyhow::Error)` - Unreadable file, missing column, or no valid rows
pub fn read_table(source: &TableSource) -> Result<(ContingencyTable, ParseStats)> {
    let path = source.path.as_path();
    let mut reader = open_reader(path, source.delimiter)?;
    let index = header_index(&mut reader, path)?;
    let count_idx = column(&index, &source.count_column, path)?;

    let dims: Vec<String> = if source.dims.is_empty() {
        let mut ordered: Vec<(usize, String)> = index
            .iter()
            .filter(|(_, &idx)| idx != count_idx)
            .map(|(name, &idx)| (idx, name.clone()))
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, name)| name).collect()
    } else {
        source.dims.clone()
    };
    let dim_idx = dims
        .iter()
        .map(|d| column(&index, source.header_for(d), path))
        .collect::<Result<Vec<_>>>()?;

    let mut table = ContingencyTable::new(dims.iter().cloned())?;
    let mut stats = ParseStats::default();
    for result in reader.records() {
        stats.total_rows += 1;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                stats.failed += 1;
                eprintln!("Warning: Line {} - CSV parse error: {}", stats.total_rows, e);
                continue;
            }
        };

        let raw = record.get(count_idx).unwrap_or("");
        let count = match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => v,
            _ => {
                stats.failed += 1;
                eprintln!(
                    "Warning: Line {} - Invalid {} value: '{}'",
                    stats.total_rows, source.count_column, raw
                );
                continue;
            }
        };
        let key: Option<Vec<String>> = dim_idx
            .iter()
            .map(|&idx| record.get(idx).map(str::to_string))
            .collect();
        let Some(key) = key else {
            stats.failed += 1;
            eprintln!("Warning: Line {} has {} fields, skipping", stats.total_rows, record.len());
            continue;
        };
        table.add(key, count)?;
        stats.parsed += 1;
    }

    if stats.parsed == 0 {
        anyhow::bail!("No valid rows parsed from {}", path.display());
    }
    Ok((table, stats))
}

/// Per-group population totals from a one-dimensional table.
///
/// Counts must be whole numbers; groups come out in table order.
pub fn group_totals(table: &ContingencyTable) -> Result<Vec<(String, u64)>> {
    if table.dims().len() != 1 {
        anyhow::bail!(
            "Population totals need exactly one dimension, found {:?}",
            table.dims()
        );
    }
    table
        .iter()
        .map(|(key, count)| {
            if count.fract() != 0.0 {
                anyhow::bail!("Population of '{}' is not a whole number: {}", key[0], count);
            }
            Ok((key[0].clone(), count as u64))
        })
        .collect()
}

/// Read a gender pairing table with columns `first`, `second`, `weight`.
pub fn read_gender_pairing(path: &Path) -> Result<GenderPairing> {
    let mut reader = open_reader(path, ',')?;
    let index = header_index(&mut reader, path)?;
    let (first, second, weight) = (
        column(&index, "first", path)?,
        column(&index, "second", path)?,
        column(&index, "weight", path)?,
    );

    let mut pairs = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Line {} of {}", row + 1, path.display()))?;
        let weight: f64 = record[weight]
            .parse()
            .with_context(|| format!("Invalid weight on line {} of {}", row + 1, path.display()))?;
        pairs.push(GenderPair {
            first: record[first].to_string(),
            second: record[second].to_string(),
            weight,
        });
    }
    Ok(GenderPairing::new(pairs)?)
}

/// Read an age-gap table with columns `gap` (labels like `1-4`, `-1-4`)
/// and `weight`.
pub fn read_age_gaps(path: &Path) -> Result<AgeGapDistribution> {
    let mut reader = open_reader(path, ',')?;
    let index = header_index(&mut reader, path)?;
    let (gap, weight) = (column(&index, "gap", path)?, column(&index, "weight", path)?);

    let mut bins = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Line {} of {}", row + 1, path.display()))?;
        let weight: f64 = record[weight]
            .parse()
            .with_context(|| format!("Invalid weight on line {} of {}", row + 1, path.display()))?;
        bins.push(AgeGapBin::parse(&record[gap], weight)?);
    }
    Ok(AgeGapDistribution::new(bins)?)
}

// ============================================================================
// Household catalog (YAML)
// ============================================================================

/// Household catalog as written by hand: types in formation order, plus
/// distribution tables shared by every type they apply to.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub shared: SharedDistributions,
    pub types: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharedDistributions {
    pub gender_pairing: Option<PathBuf>,
    pub partner_age_gap: Option<PathBuf>,
    pub parent_child_age_gap: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    pub members: Vec<MemberSpec>,
}

/// Load a YAML household catalog, resolving table paths against its directory.
///
/// Shared partner distributions go to every two-adult type, the
/// parent-child gap to every type with children.
pub fn load_catalog(path: &Path) -> Result<HouseholdCatalog> {
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
    let file: CatalogFile =
        serde_yaml::from_str(&yaml).with_context(|| format!("Failed to parse catalog: {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let pairing = match &file.shared.gender_pairing {
        Some(p) => Some(read_gender_pairing(&resolve(base, p))?),
        None => None,
    };
    let partner_gap = match &file.shared.partner_age_gap {
        Some(p) => Some(read_age_gaps(&resolve(base, p))?),
        None => None,
    };
    let child_gap = match &file.shared.parent_child_age_gap {
        Some(p) => Some(read_age_gaps(&resolve(base, p))?),
        None => None,
    };

    let mut types = Vec::with_capacity(file.types.len());
    for entry in file.types {
        let mut household_type = HouseholdType::new(&entry.name);
        household_type.family = entry.family;
        household_type.members = entry.members;
        let (adults, children) = household_type.composition();
        if adults == 2 {
            if let Some(pairing) = &pairing {
                household_type = household_type.with_gender_pairing(pairing.clone());
            }
            if let Some(gaps) = &partner_gap {
                household_type = household_type.with_partner_age_gap(gaps.clone());
            }
        }
        if children > 0 {
            if let Some(gaps) = &child_gap {
                household_type = household_type.with_parent_child_age_gap(gaps.clone());
            }
        }
        types.push(household_type);
    }
    Ok(HouseholdCatalog::from_types(types)?)
}

// ============================================================================
// Export
// ============================================================================

fn write_records<'a, I>(path: &Path, id_column: &str, rows: I, extra: Option<(&str, Vec<String>)>) -> Result<usize>
where
    I: Iterator<Item = (&'a str, &'a BTreeMap<String, String>)> + Clone,
{
    let columns: BTreeSet<&str> = rows
        .clone()
        .flat_map(|(_, attributes)| attributes.keys().map(|k| k.as_str()))
        .collect();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![id_column];
    header.extend(columns.iter().copied());
    if let Some((name, _)) = &extra {
        header.push(*name);
    }
    writer.write_record(&header)?;

    let mut written = 0;
    for (row, (id, attributes)) in rows.enumerate() {
        let mut record: Vec<&str> = vec![id];
        record.extend(columns.iter().map(|c| attributes.get(*c).map_or("", |v| v.as_str())));
        if let Some((_, values)) = &extra {
            record.push(values.get(row).map_or("", |v| v.as_str()));
        }
        writer.write_record(&record)?;
        written += 1;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(written)
}

/// One row per agent, one column per attribute seen on any agent.
pub fn write_agents(path: &Path, agents: &[Agent]) -> Result<usize> {
    write_records(path, "agent_id", agents.iter().map(|a| (a.id(), a.attributes())), None)
}

/// One row per household; members as a `;`-separated list of agent ids.
pub fn write_households(path: &Path, households: &[Household]) -> Result<usize> {
    let members = households
        .iter()
        .map(|h| {
            h.members()
                .iter()
                .map(|m| m.agent_id.as_str())
                .collect::<Vec<_>>()
                .join(";")
        })
        .collect();
    write_records(
        path,
        "household_id",
        households.iter().map(|h| (h.id(), h.attributes())),
        Some(("members", members)),
    )
}

/// Long-format CSV of a table, readable back with [`read_table`].
pub fn write_table(path: &Path, table: &ContingencyTable, count_column: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut header: Vec<&str> = table.dims().iter().map(|d| d.as_str()).collect();
    header.push(count_column);
    writer.write_record(&header)?;
    for (key, count) in table.iter() {
        let mut record = key.clone();
        record.push(count.to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Final fit report, one row per scored comparison.
pub fn write_scorecard(path: &Path, scorecard: &Scorecard) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record([
        "attribute",
        "context",
        "dims",
        "z_squared",
        "degrees_of_freedom",
        "critical_value",
        "passed",
        "srmse",
        "total_abs_error",
        "cells",
    ])?;
    for row in scorecard.rows() {
        let report = &row.report;
        writer.write_record([
            row.attribute.clone(),
            row.context.clone(),
            report.dims.join("|"),
            format!("{:.4}", report.z_squared),
            report.degrees_of_freedom.to_string(),
            format!("{:.4}", report.critical_value),
            report.passed.to_string(),
            format!("{:.6}", report.srmse),
            format!("{:.2}", report.total_abs_error),
            report.cells.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse a CLI constraint argument of the form `dim1,dim2=path.csv`.
pub fn parse_constraint_arg(arg: &str) -> Result<TableSource> {
    let (dims, path) = arg
        .split_once('=')
        .with_context(|| format!("Constraint '{}' is not of the form dims=path", arg))?;
    let dims: Vec<&str> = dims.split(',').map(str::trim).filter(|d| !d.is_empty()).collect();
    if dims.is_empty() {
        anyhow::bail!("Constraint '{}' names no dimensions", arg);
    }
    Ok(TableSource::new(path.trim(), &dims))
}
