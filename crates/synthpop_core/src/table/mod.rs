//! Contingency tables
//!
//! Sparse mapping from attribute-value tuples to non-negative counts. Every
//! other component consumes or produces one of these: seed joints, margins,
//! fitted joints and observed crosstabs of a synthetic population.
//!
//! Combinations without a row are implicitly zero.

pub mod categories;

pub use categories::CategoryRegistry;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SynthError};

/// One cell coordinate: a category value per dimension, in dimension order.
pub type Key = Vec<String>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContingencyTable {
    dims: Vec<String>,
    cells: BTreeMap<Key, f64>,
}

impl ContingencyTable {
    /// Create an empty table over `dims`.
    pub fn new<I, S>(dims: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dims: Vec<String> = dims.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for dim in &dims {
            if !seen.insert(dim.as_str()) {
                return Err(SynthError::DuplicateDimension(dim.clone()));
            }
        }
        Ok(Self {
            dims,
            cells: BTreeMap::new(),
        })
    }

    /// Build a table from `(key, count)` rows. Duplicate keys accumulate.
    pub fn from_rows<D, DS, R, K, KS>(dims: D, rows: R) -> Result<Self>
    where
        D: IntoIterator<Item = DS>,
        DS: Into<String>,
        R: IntoIterator<Item = (K, f64)>,
        K: IntoIterator<Item = KS>,
        KS: Into<String>,
    {
        let mut table = Self::new(dims)?;
        for (key, count) in rows {
            table.add(key.into_iter().map(Into::into).collect(), count)?;
        }
        Ok(table)
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dims.iter().any(|d| d == dim)
    }

    pub fn dim_index(&self, dim: &str) -> Result<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| SynthError::UnknownDimension {
                dimension: dim.to_string(),
                available: self.dims.clone(),
            })
    }

    /// Positions of `dims` inside this table's dimensions.
    pub fn dim_indices<S: AsRef<str>>(&self, dims: &[S]) -> Result<Vec<usize>> {
        let mut seen = BTreeSet::new();
        dims.iter()
            .map(|d| {
                let d = d.as_ref();
                if !seen.insert(d) {
                    return Err(SynthError::DuplicateDimension(d.to_string()));
                }
                self.dim_index(d)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.cells.values().sum()
    }

    /// Count of a cell; absent cells are zero.
    pub fn get<S: AsRef<str>>(&self, key: &[S]) -> f64 {
        let key: Key = key.iter().map(|s| s.as_ref().to_string()).collect();
        self.cells.get(&key).copied().unwrap_or(0.0)
    }

    pub fn contains_key<S: AsRef<str>>(&self, key: &[S]) -> bool {
        let key: Key = key.iter().map(|s| s.as_ref().to_string()).collect();
        self.cells.contains_key(&key)
    }

    /// Add `count` to the cell at `key`, creating it if needed.
    pub fn add(&mut self, key: Key, count: f64) -> Result<()> {
        self.check_cell(&key, count)?;
        *self.cells.entry(key).or_insert(0.0) += count;
        Ok(())
    }

    /// Overwrite the cell at `key`.
    pub fn set(&mut self, key: Key, count: f64) -> Result<()> {
        self.check_cell(&key, count)?;
        self.cells.insert(key, count);
        Ok(())
    }

    fn check_cell(&self, key: &Key, count: f64) -> Result<()> {
        if key.len() != self.dims.len() {
            return Err(SynthError::ArityMismatch {
                expected: self.dims.len(),
                found: key.len(),
            });
        }
        if !count.is_finite() || count < 0.0 {
            return Err(SynthError::InvalidCount {
                key: key.clone(),
                count,
            });
        }
        Ok(())
    }

    /// Rows in stable (sorted key) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, f64)> {
        self.cells.iter().map(|(k, v)| (k, *v))
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> {
        self.cells.values_mut()
    }

    /// Sum the table down to `dims` (which must be a subset of this table's).
    pub fn project<S: AsRef<str>>(&self, dims: &[S]) -> Result<ContingencyTable> {
        let indices = self.dim_indices(dims)?;
        let mut projected = ContingencyTable::new(dims.iter().map(|d| d.as_ref().to_string()))?;
        for (key, count) in &self.cells {
            let sub: Key = indices.iter().map(|&i| key[i].clone()).collect();
            *projected.cells.entry(sub).or_insert(0.0) += *count;
        }
        Ok(projected)
    }

    /// Same cells with dimensions permuted into `dims` order.
    pub fn reordered<S: AsRef<str>>(&self, dims: &[S]) -> Result<ContingencyTable> {
        if dims.len() != self.dims.len() {
            return Err(SynthError::ArityMismatch {
                expected: self.dims.len(),
                found: dims.len(),
            });
        }
        self.project(dims)
    }

    /// Rows where `dim == value`, with `dim` removed.
    pub fn select(&self, dim: &str, value: &str) -> Result<ContingencyTable> {
        let idx = self.dim_index(dim)?;
        let mut selected = ContingencyTable::new(
            self.dims
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, d)| d.clone()),
        )?;
        for (key, count) in &self.cells {
            if key[idx] == value {
                let mut sub = key.clone();
                sub.remove(idx);
                selected.cells.insert(sub, *count);
            }
        }
        Ok(selected)
    }

    /// Distinct categories of `dim`, sorted.
    pub fn categories(&self, dim: &str) -> Result<Vec<String>> {
        let idx = self.dim_index(dim)?;
        let set: BTreeSet<&String> = self.cells.keys().map(|k| &k[idx]).collect();
        Ok(set.into_iter().cloned().collect())
    }

    /// Full cross-product of every dimension's categories (own categories
    /// plus any registered in `registry`), missing cells filled with zero.
    pub fn complete(&self, registry: &CategoryRegistry) -> Result<ContingencyTable> {
        let mut axes: Vec<Vec<String>> = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            let mut cats: Vec<String> = registry
                .categories(dim)
                .map(|c| c.to_vec())
                .unwrap_or_default();
            for own in self.categories(dim)? {
                if !cats.contains(&own) {
                    cats.push(own);
                }
            }
            axes.push(cats);
        }

        let mut completed = self.clone();
        let mut key: Key = Vec::with_capacity(axes.len());
        fill_cross_product(&axes, &mut key, &mut |k| {
            completed.cells.entry(k.clone()).or_insert(0.0);
        });
        Ok(completed)
    }

    /// Drop rows whose `dim` category is not in `allowed`. Returns the
    /// number of rows removed.
    pub fn retain_categories(&mut self, dim: &str, allowed: &BTreeSet<String>) -> Result<usize> {
        let idx = self.dim_index(dim)?;
        let before = self.cells.len();
        self.cells.retain(|key, _| allowed.contains(&key[idx]));
        Ok(before - self.cells.len())
    }

    pub fn filter(&self, predicate: impl Fn(&Key) -> bool) -> ContingencyTable {
        ContingencyTable {
            dims: self.dims.clone(),
            cells: self
                .cells
                .iter()
                .filter(|(k, _)| predicate(k))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    pub fn scaled(&self, factor: f64) -> ContingencyTable {
        ContingencyTable {
            dims: self.dims.clone(),
            cells: self.cells.iter().map(|(k, v)| (k.clone(), v * factor)).collect(),
        }
    }
}

fn fill_cross_product(axes: &[Vec<String>], key: &mut Key, visit: &mut impl FnMut(&Key)) {
    if key.len() == axes.len() {
        visit(key);
        return;
    }
    for category in &axes[key.len()] {
        key.push(category.clone());
        fill_cross_product(axes, key, visit);
        key.pop();
    }
}
