//! Household-level attributes derived from members.

use serde::{Deserialize, Serialize};

use super::types::Role;
use super::{agent_index, Household};
use crate::error::{Result, SynthError};
use crate::population::{Agent, Unit};

/// Coarse household classification used by neighbourhood statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HouseholdClass {
    SinglePerson,
    WithChildren,
    WithoutChildren,
}

impl HouseholdClass {
    pub fn of(household: &Household) -> Self {
        if household.count(Role::Child) > 0 {
            HouseholdClass::WithChildren
        } else if household.hh_size() == 1 {
            HouseholdClass::SinglePerson
        } else {
            HouseholdClass::WithoutChildren
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HouseholdClass::SinglePerson => "single_person",
            HouseholdClass::WithChildren => "with_children",
            HouseholdClass::WithoutChildren => "without_children",
        }
    }
}

/// Stamp every household with its [`HouseholdClass`] under `attribute`.
pub fn label_household_classes(households: &mut [Household], attribute: &str) -> Result<()> {
    for household in households.iter_mut() {
        let class = HouseholdClass::of(household);
        household.set_attribute(attribute, class.as_str().to_string())?;
    }
    Ok(())
}

/// Copy attributes of each household's oldest member onto the household.
///
/// The oldest member stands in for the principal earner. Ties go to the
/// member listed first.
///
/// # Arguments
/// * `copies` - `(member attribute, household attribute)` pairs
///
/// # Returns
/// Number of households updated
pub fn assign_principal_earner<S: AsRef<str>>(
    households: &mut [Household],
    agents: &[Agent],
    age_attribute: &str,
    copies: &[(S, S)],
) -> Result<usize> {
    let index = agent_index(agents);
    let mut updated = 0;
    for household in households.iter_mut() {
        let mut oldest: Option<(&Agent, i64)> = None;
        for member in household.members() {
            let agent = member_agent(&index, agents, &member.agent_id)?;
            let Some(age) = agent.attribute(age_attribute).and_then(|a| a.trim().parse::<i64>().ok()) else {
                continue;
            };
            if oldest.map_or(true, |(_, best)| age > best) {
                oldest = Some((agent, age));
            }
        }
        let (earner, _) = oldest.ok_or_else(|| SynthError::MissingAttribute {
            unit: household.id().to_string(),
            attribute: age_attribute.to_string(),
        })?;
        for (source, target) in copies {
            let value = earner.require(source.as_ref())?.to_string();
            household.set_attribute(target.as_ref(), value)?;
        }
        updated += 1;
    }
    Ok(updated)
}

/// Count members whose `attribute` equals `value` and store the count on the
/// household under `target` (e.g. driving licenses per household).
///
/// # Returns
/// Total count over all households
pub fn count_members_with(
    households: &mut [Household],
    agents: &[Agent],
    attribute: &str,
    value: &str,
    target: &str,
) -> Result<usize> {
    let index = agent_index(agents);
    let mut total = 0;
    for household in households.iter_mut() {
        let mut count = 0;
        for member in household.members() {
            if member_agent(&index, agents, &member.agent_id)?.attribute(attribute) == Some(value) {
                count += 1;
            }
        }
        household.set_attribute(target, count.to_string())?;
        total += count;
    }
    Ok(total)
}

fn member_agent<'a>(
    index: &fxhash::FxHashMap<&str, usize>,
    agents: &'a [Agent],
    agent_id: &str,
) -> Result<&'a Agent> {
    index
        .get(agent_id)
        .map(|&idx| &agents[idx])
        .ok_or_else(|| SynthError::InvalidValue {
            attribute: "agent_id".to_string(),
            value: agent_id.to_string(),
        })
}
