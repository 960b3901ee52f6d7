//! Household grouper
//!
//! Per group, and per household type in catalog order:
//! 1. the adult pool is every unassigned agent whose position matches the
//!    type's adult position, plus agents routed here as a fallback
//! 2. anchors are drawn from the shuffled pool; couples get a partner whose
//!    gender follows the pairing distribution and whose age is nearest to the
//!    anchor's age shifted by a sampled partner gap
//! 3. children are matched nearest to the parent's age minus a sampled
//!    parent-child gap (the parent is the female adult when there is one)
//! 4. members that cannot be placed move to the first fallback type able to
//!    take their role, or stay unassigned
//!
//! Agent state runs Unassigned → Reserved → Assigned within one pass; the
//! reservation is never persisted.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::types::{HouseholdCatalog, HouseholdType, MemberSpec, Role};
use super::{GroupingOutcome, Household, Member};
use crate::config::GroupingConfig;
use crate::error::{Result, SynthError};
use crate::population::{partition, Agent, Unit};
use crate::rng::{stream, stream_rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberState {
    Unassigned,
    Reserved,
    /// Released by one type, waiting for its fallback type (or left over)
    Deferred,
    Assigned(usize),
}

/// A household before identifiers are handed out.
struct Draft {
    group: String,
    hh_type: String,
    members: Vec<(usize, Role)>,
    degraded: bool,
}

/// Mutable state of one grouping pass.
struct Formation {
    state: Vec<MemberState>,
    drafts: Vec<Draft>,
    fallback_moves: usize,
}

impl Formation {
    fn reserve(&mut self, idx: usize) {
        self.state[idx] = MemberState::Reserved;
    }

    fn is_free(&self, idx: usize) -> bool {
        self.state[idx] == MemberState::Unassigned
    }

    fn commit(&mut self, draft: Draft) {
        let number = self.drafts.len();
        for &(idx, _) in &draft.members {
            self.state[idx] = MemberState::Assigned(number);
        }
        self.drafts.push(draft);
    }
}

/// Pending fallback arrivals per catalog index.
type Arrivals = BTreeMap<usize, Vec<(usize, Role)>>;

pub struct HouseholdGrouper<'a> {
    catalog: &'a HouseholdCatalog,
    group_key: String,
    config: GroupingConfig,
}

impl<'a> HouseholdGrouper<'a> {
    pub fn new(catalog: &'a HouseholdCatalog, group_key: &str) -> Self {
        Self {
            catalog,
            group_key: group_key.to_string(),
            config: GroupingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GroupingConfig) -> Self {
        self.config = config;
        self
    }

    /// Partition `agents` into households and stamp each member with the
    /// household identifier.
    ///
    /// # Errors
    /// Invalid catalog, an agent without the group key, or an agent that
    /// already belongs to a household. Pool exhaustion is reported on the
    /// outcome, never as an error.
    pub fn run(&self, agents: &mut [Agent]) -> Result<GroupingOutcome> {
        self.catalog.validate()?;
        if let Some(agent) = agents
            .iter()
            .find(|a| a.attribute(&self.config.household_id_attribute).is_some())
        {
            return Err(SynthError::AttributeAlreadySet {
                unit: agent.id().to_string(),
                attribute: self.config.household_id_attribute.clone(),
            });
        }

        let groups = partition(&*agents, &self.group_key)?;
        let mut formation = Formation {
            state: vec![MemberState::Unassigned; agents.len()],
            drafts: Vec::new(),
            fallback_moves: 0,
        };
        for (group, members) in &groups {
            let mut rng = stream_rng(self.config.seed, stream::HOUSEHOLDS, group);
            self.form_group(agents, group, members, &mut formation, &mut rng);
        }

        let mut outcome = GroupingOutcome::new(&self.group_key, &self.config);
        outcome.fallback_moves = formation.fallback_moves;
        for draft in formation.drafts {
            let id = outcome.next_id();
            let members = draft
                .members
                .iter()
                .map(|&(idx, role)| Member {
                    agent_id: agents[idx].id().to_string(),
                    role,
                })
                .collect();
            for &(idx, _) in &draft.members {
                agents[idx].set_attribute(&self.config.household_id_attribute, id.clone())?;
            }
            if draft.degraded {
                outcome.degraded.push(id.clone());
            }
            outcome
                .households
                .push(Household::new(id, &self.group_key, &draft.group, &draft.hh_type, members));
        }
        outcome.unassigned = formation
            .state
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, MemberState::Assigned(_)))
            .map(|(idx, _)| agents[idx].id().to_string())
            .collect();

        info!(
            "Formed {} households from {} agents ({} degraded, {} fallback moves)",
            outcome.households.len(),
            outcome.assigned_agents(),
            outcome.degraded.len(),
            outcome.fallback_moves
        );
        if !outcome.unassigned.is_empty() {
            warn!("{} agents could not be placed in a household", outcome.unassigned.len());
        }
        Ok(outcome)
    }

    fn form_group(
        &self,
        agents: &[Agent],
        group: &str,
        members: &[usize],
        formation: &mut Formation,
        rng: &mut ChaCha8Rng,
    ) {
        let mut by_position: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &idx in members {
            if let Some(position) = agents[idx].attribute(&self.config.position_attribute) {
                by_position.entry(position).or_default().push(idx);
            }
        }

        let mut arrivals = Arrivals::new();
        for (type_index, household_type) in self.catalog.iter().enumerate() {
            let pending = arrivals.remove(&type_index).unwrap_or_default();
            for &(idx, _) in &pending {
                formation.state[idx] = MemberState::Unassigned;
            }
            let pool = |role: Role| -> Vec<usize> {
                let mut pool: Vec<usize> = household_type
                    .position_for(role)
                    .and_then(|p| by_position.get(p))
                    .map(|v| v.iter().copied().filter(|&i| formation.is_free(i)).collect())
                    .unwrap_or_default();
                for &(idx, _) in pending.iter().filter(|(_, r)| *r == role) {
                    if !pool.contains(&idx) {
                        pool.push(idx);
                    }
                }
                pool
            };
            let mut adults = pool(Role::Adult);
            let mut children = pool(Role::Child);
            adults.shuffle(rng);
            children.shuffle(rng);

            let formed_before = formation.drafts.len();
            self.form_type(agents, group, household_type, &adults, &children, formation, &mut arrivals, rng);

            // Children nobody could take
            if let Some(spec) = household_type.spec(Role::Child) {
                let leftover: Vec<usize> = children.iter().copied().filter(|&c| formation.is_free(c)).collect();
                for child in leftover {
                    self.route(child, Role::Child, spec, formation, &mut arrivals);
                }
            }
            debug!(
                "{}: formed {} '{}' households",
                group,
                formation.drafts.len() - formed_before,
                household_type.name
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn form_type(
        &self,
        agents: &[Agent],
        group: &str,
        household_type: &HouseholdType,
        adults: &[usize],
        children: &[usize],
        formation: &mut Formation,
        arrivals: &mut Arrivals,
        rng: &mut ChaCha8Rng,
    ) {
        // Validated catalogs always carry an adult spec
        let Some(adult_spec) = household_type.spec(Role::Adult) else {
            return;
        };

        for &anchor in adults {
            if !formation.is_free(anchor) {
                continue;
            }
            formation.reserve(anchor);
            let mut draft = vec![(anchor, Role::Adult)];

            if adult_spec.count == 2 {
                match self.choose_partner(agents, anchor, adults, household_type, formation, rng) {
                    Some(partner) => {
                        formation.reserve(partner);
                        draft.push((partner, Role::Adult));
                    }
                    None => {
                        self.route(anchor, Role::Adult, adult_spec, formation, arrivals);
                        continue;
                    }
                }
            }

            let mut degraded = false;
            if let Some(child_spec) = household_type.spec(Role::Child) {
                let parent = draft
                    .iter()
                    .map(|&(idx, _)| idx)
                    .find(|&idx| agents[idx].attribute(&self.config.gender_attribute) == Some("female"))
                    .unwrap_or(anchor);
                let mut placed = 0;
                for _ in 0..child_spec.count {
                    match self.choose_child(agents, parent, children, household_type, formation, rng) {
                        Some(child) => {
                            formation.reserve(child);
                            draft.push((child, Role::Child));
                            placed += 1;
                        }
                        None => break,
                    }
                }
                if placed == 0 {
                    for &(idx, role) in &draft {
                        self.route(idx, role, adult_spec, formation, arrivals);
                    }
                    continue;
                }
                degraded = placed < child_spec.count;
            }

            formation.commit(Draft {
                group: group.to_string(),
                hh_type: household_type.name.clone(),
                members: draft,
                degraded,
            });
        }
    }

    /// Release `idx` and queue it at the first fallback able to take `role`.
    fn route(&self, idx: usize, role: Role, spec: &MemberSpec, formation: &mut Formation, arrivals: &mut Arrivals) {
        formation.state[idx] = MemberState::Deferred;
        let target = spec.fallbacks.iter().find_map(|name| {
            let index = self.catalog.index_of(name)?;
            let fallback = self.catalog.get(name).ok()?;
            fallback.spec(role).map(|_| index)
        });
        if let Some(index) = target {
            arrivals.entry(index).or_default().push((idx, role));
            formation.fallback_moves += 1;
        }
    }

    fn choose_partner(
        &self,
        agents: &[Agent],
        anchor: usize,
        pool: &[usize],
        household_type: &HouseholdType,
        formation: &Formation,
        rng: &mut ChaCha8Rng,
    ) -> Option<usize> {
        let candidates: Vec<usize> = pool.iter().copied().filter(|&i| formation.is_free(i)).collect();
        if candidates.is_empty() {
            return None;
        }

        let pairing = &household_type.gender_pairing;
        let anchor_gender = agents[anchor].attribute(&self.config.gender_attribute);
        let (preferences, anchor_first) = match anchor_gender {
            Some(gender) if !pairing.is_empty() => match pairing.sample_partner(gender, rng) {
                Some(draw) => {
                    let mut preferences = vec![draw.gender.clone()];
                    preferences.extend(
                        pairing
                            .partner_genders(gender)
                            .into_iter()
                            .filter(|g| *g != draw.gender),
                    );
                    (Some(preferences), draw.anchor_first)
                }
                None => (None, true),
            },
            _ => (None, true),
        };

        let gap = household_type.partner_age_gap.sample(rng);
        let target_age = self
            .age_of(&agents[anchor])
            .zip(gap)
            .map(|(age, gap)| if anchor_first { age - gap } else { age + gap });

        match preferences {
            None => self.nearest_age(agents, &candidates, target_age),
            Some(genders) => genders.iter().find_map(|gender| {
                let matching: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&c| agents[c].attribute(&self.config.gender_attribute) == Some(gender.as_str()))
                    .collect();
                self.nearest_age(agents, &matching, target_age)
            }),
        }
    }

    fn choose_child(
        &self,
        agents: &[Agent],
        parent: usize,
        pool: &[usize],
        household_type: &HouseholdType,
        formation: &Formation,
        rng: &mut ChaCha8Rng,
    ) -> Option<usize> {
        let candidates: Vec<usize> = pool.iter().copied().filter(|&i| formation.is_free(i)).collect();
        let gap = household_type.parent_child_age_gap.sample(rng);
        let target_age = self.age_of(&agents[parent]).zip(gap).map(|(age, gap)| age - gap);
        self.nearest_age(agents, &candidates, target_age)
    }

    /// Candidate whose age is closest to `target_age`; the first candidate
    /// wins ties and unknown ages.
    fn nearest_age(&self, agents: &[Agent], candidates: &[usize], target_age: Option<i64>) -> Option<usize> {
        candidates.iter().copied().min_by_key(|&c| {
            match (self.age_of(&agents[c]), target_age) {
                (Some(age), Some(target)) => (age - target).abs(),
                _ => i64::MAX,
            }
        })
    }

    fn age_of(&self, agent: &Agent) -> Option<i64> {
        agent
            .attribute(&self.config.age_attribute)
            .and_then(|a| a.trim().parse::<i64>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::household::types::{AgeGapDistribution, GenderPair, GenderPairing};
    use crate::population::instantiate;

    fn pairing() -> GenderPairing {
        GenderPairing::new(vec![GenderPair {
            first: "male".into(),
            second: "female".into(),
            weight: 1.0,
        }])
        .unwrap()
    }

    fn catalog() -> HouseholdCatalog {
        let married = |name: &str, children: usize| {
            let mut t = HouseholdType::new(name)
                .with_family("married")
                .with_gender_pairing(pairing())
                .with_partner_age_gap(AgeGapDistribution::from_labels(&[("0-0", 1.0)]).unwrap())
                .with_parent_child_age_gap(AgeGapDistribution::from_labels(&[("30-30", 1.0)]).unwrap());
            if children > 0 {
                t = t.add_members::<&str>(&format!("child_in_{}", name), Role::Child, children, &[]);
            }
            let fallbacks: &[&str] = if children > 0 { &["married_no_children", "single"] } else { &["single"] };
            t.add_members(name, Role::Adult, 2, fallbacks)
        };
        HouseholdCatalog::from_types(vec![
            married("married_with_2_children", 2),
            married("married_no_children", 0),
            HouseholdType::new("single").add_members::<&str>("single", Role::Adult, 1, &[]),
        ])
        .unwrap()
    }

    /// (position, gender, age) per agent, all in one neighbourhood.
    fn population(people: &[(&str, &str, u32)]) -> Vec<Agent> {
        let mut agents = instantiate("neighb_code", &[("BU01".to_string(), people.len() as u64)]);
        for (agent, (position, gender, age)) in agents.iter_mut().zip(people) {
            agent.set_attribute("household_position", position.to_string()).unwrap();
            agent.set_attribute("gender", gender.to_string()).unwrap();
            agent.set_attribute("age", age.to_string()).unwrap();
        }
        agents
    }

    #[test]
    fn test_family_with_children() {
        let mut agents = population(&[
            ("married_with_2_children", "male", 40),
            ("married_with_2_children", "female", 40),
            ("child_in_married_with_2_children", "female", 10),
            ("child_in_married_with_2_children", "male", 8),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        assert_eq!(outcome.households.len(), 1);
        let household = &outcome.households[0];
        assert_eq!(household.hh_type(), "married_with_2_children");
        assert_eq!(household.hh_size(), 4);
        assert_eq!(household.composition(), (2, 2));
        assert!(outcome.unassigned.is_empty());
        assert!(agents.iter().all(|a| a.attribute("household_id") == Some("HH000000")));
    }

    #[test]
    fn test_partner_matches_gender_and_age() {
        let mut agents = population(&[
            ("married_no_children", "male", 30),
            ("married_no_children", "female", 60),
            ("married_no_children", "female", 31),
            ("married_no_children", "male", 61),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        assert_eq!(outcome.households.len(), 2);
        for household in &outcome.households {
            let ids: Vec<&str> = household.members().iter().map(|m| m.agent_id.as_str()).collect();
            let pair = (ids.contains(&"SA000000") && ids.contains(&"SA000002"))
                || (ids.contains(&"SA000001") && ids.contains(&"SA000003"));
            assert!(pair, "unexpected couple {:?}", ids);
        }
    }

    #[test]
    fn test_no_children_sends_couple_to_fallback() {
        let mut agents = population(&[
            ("married_with_2_children", "male", 40),
            ("married_with_2_children", "female", 38),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        assert_eq!(outcome.households.len(), 1);
        assert_eq!(outcome.households[0].hh_type(), "married_no_children");
        assert_eq!(outcome.households[0].hh_size(), 2);
        assert_eq!(outcome.fallback_moves, 2);
    }

    #[test]
    fn test_partial_children_form_degraded_household() {
        let mut agents = population(&[
            ("married_with_2_children", "male", 40),
            ("married_with_2_children", "female", 38),
            ("child_in_married_with_2_children", "male", 6),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        assert_eq!(outcome.households[0].hh_type(), "married_with_2_children");
        assert_eq!(outcome.households[0].hh_size(), 3);
        assert_eq!(outcome.degraded, vec!["HH000000".to_string()]);
    }

    #[test]
    fn test_unpaired_adult_falls_back_to_single() {
        let mut agents = population(&[
            ("married_no_children", "male", 30),
            ("married_no_children", "female", 31),
            ("married_no_children", "male", 50),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        let mut types: Vec<&str> = outcome.households.iter().map(|h| h.hh_type()).collect();
        types.sort();
        assert_eq!(types, vec!["married_no_children", "single"]);
        assert_eq!(outcome.assigned_agents(), 3);
    }

    #[test]
    fn test_children_without_parents_stay_unassigned() {
        let mut agents = population(&[
            ("child_in_married_with_2_children", "male", 6),
            ("student", "female", 20),
        ]);
        let catalog = catalog();
        let outcome = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        assert!(outcome.households.is_empty());
        assert_eq!(outcome.unassigned, vec!["SA000000".to_string(), "SA000001".to_string()]);
        assert!(agents[0].attribute("household_id").is_none());
    }

    #[test]
    fn test_grouping_twice_is_rejected() {
        let mut agents = population(&[("single", "male", 30)]);
        let catalog = catalog();
        HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap();
        let err = HouseholdGrouper::new(&catalog, "neighb_code").run(&mut agents).unwrap_err();
        assert!(matches!(err, SynthError::AttributeAlreadySet { .. }));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const POSITIONS: [&str; 5] = [
            "married_with_2_children",
            "child_in_married_with_2_children",
            "married_no_children",
            "single",
            "student",
        ];

        proptest! {
            /// Property: no agent is in two households and sizes add up to
            /// the number of placed agents
            #[test]
            fn prop_household_size_consistency(
                people in proptest::collection::vec((0usize..5, any::<bool>(), 0u32..90), 0..60),
                seed in any::<u64>(),
            ) {
                let people: Vec<(&str, &str, u32)> = people
                    .iter()
                    .map(|(p, female, age)| (POSITIONS[*p], if *female { "female" } else { "male" }, *age))
                    .collect();
                let mut agents = population(&people);
                let catalog = catalog();
                let config = GroupingConfig { seed, ..GroupingConfig::default() };
                let outcome = HouseholdGrouper::new(&catalog, "neighb_code")
                    .with_config(config)
                    .run(&mut agents)
                    .unwrap();

                let mut seen = std::collections::BTreeSet::new();
                for household in &outcome.households {
                    prop_assert_eq!(household.hh_size(), household.members().len());
                    for member in household.members() {
                        prop_assert!(seen.insert(member.agent_id.clone()));
                    }
                }
                prop_assert_eq!(outcome.assigned_agents(), seen.len());
                prop_assert_eq!(outcome.assigned_agents() + outcome.unassigned.len(), agents.len());
            }
        }
    }
}
