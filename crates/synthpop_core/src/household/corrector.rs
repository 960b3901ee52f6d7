//! Composition corrector
//!
//! Households formed with fewer members than their type asks for keep their
//! nominal `hh_type` after grouping. This pass relabels them to the type whose
//! composition they actually have, then rewrites each member's household
//! position to the label of its (possibly new) type. Membership never changes,
//! and running the pass twice is the same as running it once.

use std::collections::VecDeque;

use fxhash::FxHashMap;
use log::{info, warn};

use super::types::{HouseholdCatalog, HouseholdType, Role};
use super::{agent_index, Household};
use crate::error::{Result, SynthError};
use crate::population::{Agent, Unit};

#[derive(Debug, Clone, PartialEq)]
pub struct Relabel {
    pub household: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionReport {
    pub relabeled: Vec<Relabel>,
    /// Member positions that changed
    pub positions_rewritten: usize,
    /// Households whose composition matches no reachable type
    pub unmatched: Vec<String>,
}

pub struct CompositionCorrector<'a> {
    catalog: &'a HouseholdCatalog,
    position_attribute: String,
}

impl<'a> CompositionCorrector<'a> {
    pub fn new(catalog: &'a HouseholdCatalog) -> Self {
        Self {
            catalog,
            position_attribute: "household_position".to_string(),
        }
    }

    pub fn with_position_attribute(mut self, attribute: &str) -> Self {
        self.position_attribute = attribute.to_string();
        self
    }

    /// Relabel households to their realized composition and rewrite member
    /// positions to match.
    ///
    /// # Errors
    /// A household of an unregistered type, or a member missing from `agents`.
    pub fn correct(&self, households: &mut [Household], agents: &mut [Agent]) -> Result<CorrectionReport> {
        let index: FxHashMap<String, usize> = agent_index(agents)
            .into_iter()
            .map(|(id, idx)| (id.to_string(), idx))
            .collect();

        let mut report = CorrectionReport::default();
        for household in households.iter_mut() {
            let nominal = self.catalog.get(household.hh_type())?;
            let realized = household.composition();

            let current = if realized == nominal.composition() {
                nominal
            } else if let Some(target) = self.resolve(nominal, realized) {
                report.relabeled.push(Relabel {
                    household: household.id().to_string(),
                    from: nominal.name.clone(),
                    to: target.name.clone(),
                });
                household.relabel_type(&target.name);
                target
            } else {
                report.unmatched.push(household.id().to_string());
                nominal
            };

            for member in household.members() {
                let Some(position) = current.position_for(member.role) else {
                    continue;
                };
                let idx = *index.get(&member.agent_id).ok_or_else(|| SynthError::InvalidValue {
                    attribute: "agent_id".to_string(),
                    value: member.agent_id.clone(),
                })?;
                if agents[idx].attribute(&self.position_attribute) != Some(position) {
                    agents[idx].relabel(&self.position_attribute, position.to_string());
                    report.positions_rewritten += 1;
                }
            }
        }

        info!(
            "Relabeled {} households, rewrote {} member positions",
            report.relabeled.len(),
            report.positions_rewritten
        );
        if !report.unmatched.is_empty() {
            warn!(
                "{} households match no registered composition",
                report.unmatched.len()
            );
        }
        Ok(report)
    }

    /// Smaller type with the realized composition: same family first, then
    /// fallbacks breadth-first in listed order.
    fn resolve(&self, nominal: &HouseholdType, realized: (usize, usize)) -> Option<&'a HouseholdType> {
        if let Some(family) = &nominal.family {
            if let Some(found) = self.catalog.family_member(family, realized) {
                return Some(found);
            }
        }

        let mut visited = vec![nominal.name.clone()];
        let mut queue: VecDeque<&'a HouseholdType> = VecDeque::new();
        queue.extend(self.fallbacks_of(nominal));
        while let Some(candidate) = queue.pop_front() {
            if visited.contains(&candidate.name) {
                continue;
            }
            if candidate.composition() == realized {
                return Some(candidate);
            }
            visited.push(candidate.name.clone());
            queue.extend(self.fallbacks_of(candidate));
        }
        None
    }

    fn fallbacks_of(&self, household_type: &HouseholdType) -> Vec<&'a HouseholdType> {
        household_type
            .spec(Role::Adult)
            .map(|spec| {
                spec.fallbacks
                    .iter()
                    .filter_map(|name| self.catalog.get(name).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::household::Member;
    use crate::population::instantiate;

    fn catalog() -> HouseholdCatalog {
        let with_children = |name: &str, family: &str, adults: usize, children: usize, fallbacks: &[&str]| {
            HouseholdType::new(name)
                .with_family(family)
                .add_members::<&str>(&format!("child_in_{}", name), Role::Child, children, &[])
                .add_members(name, Role::Adult, adults, fallbacks)
        };
        HouseholdCatalog::from_types(vec![
            with_children("married_with_2_children", "married", 2, 2, &["married_no_children", "single"]),
            with_children("married_with_1_children", "married", 2, 1, &["married_no_children", "single"]),
            with_children("single_parent_2_children", "single_parent", 1, 2, &["single"]),
            HouseholdType::new("married_no_children")
                .with_family("married")
                .add_members("married_no_children", Role::Adult, 2, &["single"]),
            HouseholdType::new("single").add_members::<&str>("single", Role::Adult, 1, &[]),
        ])
        .unwrap()
    }

    fn household(id: &str, hh_type: &str, members: &[(&str, Role)]) -> Household {
        Household::new(
            id,
            "neighb_code",
            "BU01",
            hh_type,
            members
                .iter()
                .map(|(agent_id, role)| Member {
                    agent_id: agent_id.to_string(),
                    role: *role,
                })
                .collect(),
        )
    }

    fn agents(positions: &[&str]) -> Vec<Agent> {
        let mut agents = instantiate("neighb_code", &[("BU01".to_string(), positions.len() as u64)]);
        for (agent, position) in agents.iter_mut().zip(positions) {
            agent.set_attribute("household_position", position.to_string()).unwrap();
        }
        agents
    }

    #[test]
    fn test_degraded_household_relabeled_within_family() {
        let catalog = catalog();
        let mut agents = agents(&[
            "married_with_2_children",
            "married_with_2_children",
            "child_in_married_with_2_children",
        ]);
        let mut households = vec![household(
            "HH000000",
            "married_with_2_children",
            &[("SA000000", Role::Adult), ("SA000001", Role::Adult), ("SA000002", Role::Child)],
        )];
        let report = CompositionCorrector::new(&catalog)
            .correct(&mut households, &mut agents)
            .unwrap();
        assert_eq!(households[0].hh_type(), "married_with_1_children");
        assert_eq!(households[0].hh_size(), 3);
        assert_eq!(report.relabeled.len(), 1);
        assert_eq!(report.positions_rewritten, 3);
        assert_eq!(agents[2].attribute("household_position"), Some("child_in_married_with_1_children"));
        assert_eq!(agents[0].attribute("household_position"), Some("married_with_1_children"));
    }

    #[test]
    fn test_single_parent_without_children_becomes_single() {
        let catalog = catalog();
        let mut agents = agents(&["single_parent_2_children"]);
        let mut households = vec![household("HH000000", "single_parent_2_children", &[("SA000000", Role::Adult)])];
        CompositionCorrector::new(&catalog)
            .correct(&mut households, &mut agents)
            .unwrap();
        assert_eq!(households[0].hh_type(), "single");
        assert_eq!(agents[0].attribute("household_position"), Some("single"));
    }

    #[test]
    fn test_arrival_positions_rewritten() {
        let catalog = catalog();
        let mut agents = agents(&["married_with_2_children", "married_no_children"]);
        let mut households = vec![household(
            "HH000000",
            "married_no_children",
            &[("SA000000", Role::Adult), ("SA000001", Role::Adult)],
        )];
        let report = CompositionCorrector::new(&catalog)
            .correct(&mut households, &mut agents)
            .unwrap();
        assert!(report.relabeled.is_empty());
        assert_eq!(report.positions_rewritten, 1);
        assert_eq!(agents[0].attribute("household_position"), Some("married_no_children"));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let catalog = catalog();
        let mut agents = agents(&["single"]);
        let mut households = vec![household("HH000000", "commune", &[("SA000000", Role::Adult)])];
        let err = CompositionCorrector::new(&catalog)
            .correct(&mut households, &mut agents)
            .unwrap_err();
        assert_eq!(err, SynthError::UnknownHouseholdType("commune".into()));
    }

    #[test]
    fn test_correct_is_idempotent() {
        let catalog = catalog();
        let mut agents = agents(&[
            "married_with_2_children",
            "married_with_2_children",
            "single_parent_2_children",
        ]);
        let mut households = vec![
            household(
                "HH000000",
                "married_with_2_children",
                &[("SA000000", Role::Adult), ("SA000001", Role::Adult)],
            ),
            household("HH000001", "single_parent_2_children", &[("SA000002", Role::Adult)]),
        ];
        let corrector = CompositionCorrector::new(&catalog);
        corrector.correct(&mut households, &mut agents).unwrap();
        let (once_households, once_agents) = (households.clone(), agents.clone());

        let report = corrector.correct(&mut households, &mut agents).unwrap();
        assert_eq!(households, once_households);
        assert_eq!(agents, once_agents);
        assert_eq!(report, CorrectionReport::default());
        assert_eq!(households[0].hh_type(), "married_no_children");
    }
}
