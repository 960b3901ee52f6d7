//! Category registry
//!
//! Category sets are only known after the margin tables have been read, so
//! they are collected once per attribute and passed around explicitly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ContingencyTable;
use crate::error::{Result, SynthError};

/// Ordered category lists per attribute.
///
/// Registration order is preserved; it decides the column order of completed
/// crosstabs and the order of categories handed to the rounding step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryRegistry {
    attributes: BTreeMap<String, Vec<String>>,
}

impl CategoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every category seen in any of `tables`, per dimension.
    pub fn from_tables(tables: &[&ContingencyTable]) -> Self {
        let mut registry = Self::new();
        for table in tables {
            for (idx, dim) in table.dims().iter().enumerate() {
                for (key, _) in table.iter() {
                    registry.add(dim, &key[idx]);
                }
            }
        }
        registry
    }

    /// Register categories for `attribute`, ignoring ones already known.
    pub fn register<I, S>(&mut self, attribute: &str, categories: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for category in categories {
            let category = category.into();
            self.add(attribute, &category);
        }
        self
    }

    fn add(&mut self, attribute: &str, category: &str) {
        let entry = self.attributes.entry(attribute.to_string()).or_default();
        if !entry.iter().any(|c| c == category) {
            entry.push(category.to_string());
        }
    }

    pub fn categories(&self, attribute: &str) -> Result<&[String]> {
        self.attributes
            .get(attribute)
            .map(|v| v.as_slice())
            .ok_or_else(|| SynthError::UnknownDimension {
                dimension: attribute.to_string(),
                available: self.attributes.keys().cloned().collect(),
            })
    }

    pub fn contains(&self, attribute: &str, category: &str) -> bool {
        self.attributes
            .get(attribute)
            .is_some_and(|v| v.iter().any(|c| c == category))
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_keeps_order_and_dedups() {
        let mut registry = CategoryRegistry::new();
        registry.register("gender", ["male", "female", "male"]);
        assert_eq!(registry.categories("gender").unwrap(), &["male", "female"]);
        assert!(registry.contains("gender", "female"));
        assert!(!registry.contains("gender", "other"));
    }

    #[test]
    fn test_from_tables_collects_all_dimensions() {
        let table = ContingencyTable::from_rows(
            ["age_group", "gender"],
            [(vec!["0-15", "male"], 3.0), (vec!["15-25", "female"], 2.0)],
        )
        .unwrap();
        let registry = CategoryRegistry::from_tables(&[&table]);
        assert_eq!(registry.categories("age_group").unwrap().len(), 2);
        assert!(registry.categories("income").is_err());
    }
}
