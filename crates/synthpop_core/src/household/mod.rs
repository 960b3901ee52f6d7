//! Household formation
//!
//! Agents carrying a household position are partitioned into households by
//! [`HouseholdGrouper`], relabeled to their realized composition by
//! [`CompositionCorrector`], and enriched with household-level attributes by
//! the helpers in [`enrich`].
//!
//! Households are created in one batch and afterwards only relabeled; their
//! membership and `hh_size` never change.

pub mod corrector;
pub mod enrich;
pub mod grouper;
pub mod types;

pub use corrector::{CompositionCorrector, CorrectionReport, Relabel};
pub use enrich::{assign_principal_earner, count_members_with, label_household_classes, HouseholdClass};
pub use grouper::HouseholdGrouper;
pub use types::{
    AgeGapBin, AgeGapDistribution, GenderPair, GenderPairing, HouseholdCatalog, HouseholdType, MemberSpec,
    PartnerDraw, Role,
};

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::config::GroupingConfig;
use crate::error::{Result, SynthError};
use crate::population::{Agent, Unit};

/// Attribute names every household carries.
pub const HH_TYPE: &str = "hh_type";
pub const HH_SIZE: &str = "hh_size";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub agent_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Household {
    id: String,
    hh_size: usize,
    members: Vec<Member>,
    attributes: BTreeMap<String, String>,
}

impl Household {
    pub fn new(id: impl Into<String>, group_key: &str, group: &str, hh_type: &str, members: Vec<Member>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(group_key.to_string(), group.to_string());
        attributes.insert(HH_TYPE.to_string(), hh_type.to_string());
        attributes.insert(HH_SIZE.to_string(), members.len().to_string());
        Self {
            id: id.into(),
            hh_size: members.len(),
            members,
            attributes,
        }
    }

    pub fn hh_type(&self) -> &str {
        self.attributes.get(HH_TYPE).map_or("", |s| s.as_str())
    }

    pub fn hh_size(&self) -> usize {
        self.hh_size
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn count(&self, role: Role) -> usize {
        self.members.iter().filter(|m| m.role == role).count()
    }

    /// Realized (adults, children).
    pub fn composition(&self) -> (usize, usize) {
        (self.count(Role::Adult), self.count(Role::Child))
    }

    pub(crate) fn relabel_type(&mut self, hh_type: &str) {
        self.attributes.insert(HH_TYPE.to_string(), hh_type.to_string());
    }
}

impl Unit for Household {
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

/// Index agents by identifier.
pub(crate) fn agent_index(agents: &[Agent]) -> FxHashMap<&str, usize> {
    agents
        .iter()
        .enumerate()
        .map(|(idx, agent)| (agent.id(), idx))
        .collect()
}

/// Result of a grouping pass.
#[derive(Debug, Clone)]
pub struct GroupingOutcome {
    pub households: Vec<Household>,
    /// Agents left without a household, in population order
    pub unassigned: Vec<String>,
    /// Households formed with fewer children than their type requires
    pub degraded: Vec<String>,
    /// Agents moved on to a fallback type (an agent may move more than once)
    pub fallback_moves: usize,
    group_key: String,
    id_attribute: String,
    id_prefix: String,
}

impl GroupingOutcome {
    pub(crate) fn new(group_key: &str, config: &GroupingConfig) -> Self {
        Self {
            households: Vec::new(),
            unassigned: Vec::new(),
            degraded: Vec::new(),
            fallback_moves: 0,
            group_key: group_key.to_string(),
            id_attribute: config.household_id_attribute.clone(),
            id_prefix: config.household_id_prefix.clone(),
        }
    }

    pub(crate) fn next_id(&self) -> String {
        format!("{}{:06}", self.id_prefix, self.households.len())
    }

    /// Number of agents placed in a household.
    pub fn assigned_agents(&self) -> usize {
        self.households.iter().map(|h| h.hh_size()).sum()
    }

    /// Place every unassigned agent in a one-person household of `household_type`.
    ///
    /// # Returns
    /// Number of households created
    pub fn absorb_leftovers(&mut self, agents: &mut [Agent], household_type: &HouseholdType) -> Result<usize> {
        if household_type.composition() != (1, 0) {
            return Err(SynthError::InvalidHouseholdType {
                name: household_type.name.clone(),
                reason: "leftovers can only form one-person households".to_string(),
            });
        }

        let index: FxHashMap<String, usize> = agent_index(agents)
            .into_iter()
            .map(|(id, idx)| (id.to_string(), idx))
            .collect();
        let leftovers = std::mem::take(&mut self.unassigned);
        let mut created = 0;
        for agent_id in leftovers {
            let idx = *index.get(&agent_id).ok_or_else(|| SynthError::InvalidValue {
                attribute: "agent_id".to_string(),
                value: agent_id.clone(),
            })?;
            let id = self.next_id();
            let group = agents[idx].require(&self.group_key)?.to_string();
            agents[idx].set_attribute(&self.id_attribute, id.clone())?;
            self.households.push(Household::new(
                id,
                &self.group_key,
                &group,
                &household_type.name,
                vec![Member {
                    agent_id,
                    role: Role::Adult,
                }],
            ));
            created += 1;
        }
        if created > 0 {
            info!("Absorbed {} leftover agents as '{}' households", created, household_type.name);
        }
        Ok(created)
    }
}
