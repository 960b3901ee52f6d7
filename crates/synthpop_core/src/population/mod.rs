//! Synthetic population units
//!
//! Agents (and households, see [`crate::household`]) are records of
//! categorical attributes. Attributes accumulate one stage at a time; a value
//! once set is never overwritten except by the household relabeling pass.

pub mod bands;

pub use bands::AgeBands;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};
use crate::table::{CategoryRegistry, ContingencyTable};

/// Anything attributes can be assigned to.
pub trait Unit {
    fn id(&self) -> &str;

    fn attribute(&self, name: &str) -> Option<&str>;

    /// Add a new attribute. Fails if the unit already carries `name`.
    fn set_attribute(&mut self, name: &str, value: String) -> Result<()>;

    fn require(&self, name: &str) -> Result<&str> {
        self.attribute(name).ok_or_else(|| SynthError::MissingAttribute {
            unit: self.id().to_string(),
            attribute: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    id: String,
    attributes: BTreeMap<String, String>,
}

impl Agent {
    /// New agent living in `group` (stored under the `group_key` attribute).
    pub fn new(id: impl Into<String>, group_key: &str, group: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(group_key.to_string(), group.into());
        Self {
            id: id.into(),
            attributes,
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Overwrite a household-derived field during corrective relabeling.
    pub(crate) fn relabel(&mut self, name: &str, value: String) {
        self.attributes.insert(name.to_string(), value);
    }
}

impl Unit for Agent {
    fn id(&self) -> &str {
        &self.id
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    fn set_attribute(&mut self, name: &str, value: String) -> Result<()> {
        if self.attributes.contains_key(name) {
            return Err(SynthError::AttributeAlreadySet {
                unit: self.id.clone(),
                attribute: name.to_string(),
            });
        }
        self.attributes.insert(name.to_string(), value);
        Ok(())
    }
}

/// Create the initial agent pool from per-group population totals.
///
/// Identifiers are `SA000000`, `SA000001`, ... numbered contiguously across
/// groups in the order given.
pub fn instantiate(group_key: &str, totals: &[(String, u64)]) -> Vec<Agent> {
    let capacity = totals.iter().map(|(_, n)| *n as usize).sum();
    let mut agents = Vec::with_capacity(capacity);
    for (group, total) in totals {
        for _ in 0..*total {
            let id = format!("SA{:06}", agents.len());
            agents.push(Agent::new(id, group_key, group.clone()));
        }
    }
    log::info!(
        "Instantiated {} agents across {} groups",
        agents.len(),
        totals.len()
    );
    agents
}

/// Count units per combination of `dims`.
///
/// With `complete`, every combination of observed categories (plus any in
/// `registry`) is present, zero-filled.
pub fn crosstab<U: Unit, S: AsRef<str>>(
    units: &[U],
    dims: &[S],
    complete: Option<&CategoryRegistry>,
) -> Result<ContingencyTable> {
    let mut table = ContingencyTable::new(dims.iter().map(|d| d.as_ref().to_string()))?;
    for unit in units {
        let key = dims
            .iter()
            .map(|d| unit.require(d.as_ref()).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        table.add(key, 1.0)?;
    }
    match complete {
        Some(registry) => table.complete(registry),
        None => Ok(table),
    }
}

/// Add `target` to every unit, computed from its `source` attribute.
///
/// Returns the number of units for which `derive` produced no value (those
/// units are left without `target`).
pub fn derive_attribute<U: Unit>(
    units: &mut [U],
    source: &str,
    target: &str,
    derive: impl Fn(&str) -> Option<String>,
) -> Result<usize> {
    let mut skipped = 0;
    for unit in units.iter_mut() {
        let value = derive(unit.require(source)?);
        match value {
            Some(value) => unit.set_attribute(target, value)?,
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        log::warn!(
            "derive {} -> {}: {} units without a derived value",
            source,
            target,
            skipped
        );
    }
    Ok(skipped)
}

/// Group unit indices by the value of `group_key`.
pub(crate) fn partition<U: Unit>(units: &[U], group_key: &str) -> Result<BTreeMap<String, Vec<usize>>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, unit) in units.iter().enumerate() {
        groups
            .entry(unit.require(group_key)?.to_string())
            .or_default()
            .push(idx);
    }
    Ok(groups)
}
