//! Household type definitions
//!
//! A `HouseholdType` is a composition template: one adult member spec (one or
//! two adults), at most one child member spec, and the distributions used to
//! pair members up. Types are registered in a [`HouseholdCatalog`], whose order
//! is the formation order.

use rand::Rng;
use rand_distr::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};

// ============================================================================
// Members
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Adult,
    Child,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Adult => "adult",
            Role::Child => "child",
        }
    }
}

/// Members of one role within a household type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Household position label that selects eligible agents
    pub position: String,
    pub role: Role,
    pub count: usize,
    /// Types that unplaced members of this role move on to, tried in order
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

// ============================================================================
// Distributions
// ============================================================================

/// Weighted age-gap bin, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeGapBin {
    pub min: i64,
    pub max: i64,
    pub weight: f64,
}

impl AgeGapBin {
    /// Parse a gap label.
    ///
    /// `a-b` is the range [a, b]; a leading minus negates the whole range, so
    /// `-1-4` is [-4, -1]. A bare number is a single gap.
    pub fn parse(label: &str, weight: f64) -> Result<Self> {
        let invalid = || SynthError::InvalidValue {
            attribute: "age_gap".to_string(),
            value: label.to_string(),
        };
        let number = |s: &str| s.trim().parse::<i64>().map_err(|_| invalid());

        let trimmed = label.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (lo, hi) = match body.split_once('-') {
            Some((lo, hi)) => (number(lo)?, number(hi)?),
            None => {
                let exact = number(body)?;
                (exact, exact)
            }
        };
        if hi < lo {
            return Err(invalid());
        }
        let (min, max) = if negative { (-hi, -lo) } else { (lo, hi) };
        Ok(Self { min, max, weight })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgeGapDistribution {
    bins: Vec<AgeGapBin>,
}

impl AgeGapDistribution {
    pub fn new(bins: Vec<AgeGapBin>) -> Result<Self> {
        check_weights(bins.iter().map(|b| b.weight), "age gap")?;
        Ok(Self { bins })
    }

    /// Build from `(label, weight)` pairs, see [`AgeGapBin::parse`].
    pub fn from_labels<S: AsRef<str>>(entries: &[(S, f64)]) -> Result<Self> {
        let bins = entries
            .iter()
            .map(|(label, weight)| AgeGapBin::parse(label.as_ref(), *weight))
            .collect::<Result<Vec<_>>>()?;
        Self::new(bins)
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn bins(&self) -> &[AgeGapBin] {
        &self.bins
    }

    /// Draw a bin by weight, then a gap uniformly inside it.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<i64> {
        let index = WeightedIndex::new(self.bins.iter().map(|b| b.weight)).ok()?;
        let bin = &self.bins[index.sample(rng)];
        Some(rng.gen_range(bin.min..=bin.max))
    }
}

/// Weighted (first partner, second partner) gender combinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenderPair {
    pub first: String,
    pub second: String,
    pub weight: f64,
}

/// Partner gender drawn for an anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerDraw {
    pub gender: String,
    /// Whether the anchor takes the first-partner slot; age gaps are
    /// first minus second
    pub anchor_first: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenderPairing {
    pairs: Vec<GenderPair>,
}

impl GenderPairing {
    pub fn new(pairs: Vec<GenderPair>) -> Result<Self> {
        check_weights(pairs.iter().map(|p| p.weight), "gender pairing")?;
        Ok(Self { pairs })
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[GenderPair] {
        &self.pairs
    }

    /// Options for an anchor of `gender`, in pair order, with weights.
    fn options(&self, gender: &str) -> Vec<(PartnerDraw, f64)> {
        let mut options = Vec::new();
        for pair in self.pairs.iter().filter(|p| p.weight > 0.0) {
            if pair.first == gender {
                options.push((
                    PartnerDraw {
                        gender: pair.second.clone(),
                        anchor_first: true,
                    },
                    pair.weight,
                ));
            } else if pair.second == gender {
                options.push((
                    PartnerDraw {
                        gender: pair.first.clone(),
                        anchor_first: false,
                    },
                    pair.weight,
                ));
            }
        }
        options
    }

    /// Partner genders an anchor of `gender` may pair with, most likely first.
    pub fn partner_genders(&self, gender: &str) -> Vec<String> {
        let mut options = self.options(gender);
        options.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut genders: Vec<String> = Vec::new();
        for (draw, _) in options {
            if !genders.contains(&draw.gender) {
                genders.push(draw.gender);
            }
        }
        genders
    }

    /// Draw the pair the anchor belongs to, conditioned on its gender.
    /// `None` if no pair contains that gender.
    pub fn sample_partner<R: Rng + ?Sized>(&self, gender: &str, rng: &mut R) -> Option<PartnerDraw> {
        let mut options = self.options(gender);
        let index = WeightedIndex::new(options.iter().map(|(_, w)| *w)).ok()?;
        Some(options.swap_remove(index.sample(rng)).0)
    }
}

fn check_weights(weights: impl Iterator<Item = f64>, what: &str) -> Result<()> {
    for weight in weights {
        if !weight.is_finite() || weight < 0.0 {
            return Err(SynthError::InvalidDistribution(format!(
                "{} weight {} must be finite and non-negative",
                what, weight
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Household type
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HouseholdType {
    pub name: String,
    /// Types of one family (e.g. `married`) differ only in child count
    #[serde(default)]
    pub family: Option<String>,
    pub members: Vec<MemberSpec>,
    #[serde(default)]
    pub gender_pairing: GenderPairing,
    /// First partner age minus second partner age
    #[serde(default)]
    pub partner_age_gap: AgeGapDistribution,
    /// Parent age minus child age
    #[serde(default)]
    pub parent_child_age_gap: AgeGapDistribution,
}

impl HouseholdType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            family: None,
            members: Vec::new(),
            gender_pairing: GenderPairing::default(),
            partner_age_gap: AgeGapDistribution::default(),
            parent_child_age_gap: AgeGapDistribution::default(),
        }
    }

    pub fn with_family(mut self, family: &str) -> Self {
        self.family = Some(family.to_string());
        self
    }

    pub fn add_members<S: AsRef<str>>(
        mut self,
        position: &str,
        role: Role,
        count: usize,
        fallbacks: &[S],
    ) -> Self {
        self.members.push(MemberSpec {
            position: position.to_string(),
            role,
            count,
            fallbacks: fallbacks.iter().map(|f| f.as_ref().to_string()).collect(),
        });
        self
    }

    pub fn with_gender_pairing(mut self, pairing: GenderPairing) -> Self {
        self.gender_pairing = pairing;
        self
    }

    pub fn with_partner_age_gap(mut self, gaps: AgeGapDistribution) -> Self {
        self.partner_age_gap = gaps;
        self
    }

    pub fn with_parent_child_age_gap(mut self, gaps: AgeGapDistribution) -> Self {
        self.parent_child_age_gap = gaps;
        self
    }

    pub fn spec(&self, role: Role) -> Option<&MemberSpec> {
        self.members.iter().find(|m| m.role == role)
    }

    pub fn count(&self, role: Role) -> usize {
        self.spec(role).map_or(0, |m| m.count)
    }

    /// (adults, children)
    pub fn composition(&self) -> (usize, usize) {
        (self.count(Role::Adult), self.count(Role::Child))
    }

    pub fn size(&self) -> usize {
        self.members.iter().map(|m| m.count).sum()
    }

    pub fn position_for(&self, role: Role) -> Option<&str> {
        self.spec(role).map(|m| m.position.as_str())
    }

    /// Structural checks that do not depend on other types.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| SynthError::InvalidHouseholdType {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("empty name"));
        }
        for role in [Role::Adult, Role::Child] {
            if self.members.iter().filter(|m| m.role == role).count() > 1 {
                return Err(invalid(&format!("more than one {} member spec", role.as_str())));
            }
        }
        match self.count(Role::Adult) {
            1 | 2 => {}
            0 => return Err(invalid("needs at least one adult")),
            _ => return Err(invalid("at most two adults are supported")),
        }
        if self.members.iter().any(|m| m.count == 0) {
            return Err(invalid("member count must be positive"));
        }
        if self.members.iter().any(|m| m.position.is_empty()) {
            return Err(invalid("empty position label"));
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Ordered household type registry.
///
/// Registration order is formation order, and a fallback must name a type
/// registered later than the type that falls back to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HouseholdCatalog {
    types: Vec<HouseholdType>,
}

impl HouseholdCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, household_type: HouseholdType) -> Result<&mut Self> {
        household_type.validate()?;
        if self.types.iter().any(|t| t.name == household_type.name) {
            return Err(SynthError::InvalidHouseholdType {
                name: household_type.name,
                reason: "registered twice".to_string(),
            });
        }
        self.types.push(household_type);
        Ok(self)
    }

    /// Build a catalog from types in formation order and validate fallbacks.
    pub fn from_types(types: Vec<HouseholdType>) -> Result<Self> {
        let mut catalog = Self::new();
        for household_type in types {
            catalog.register(household_type)?;
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Result<&HouseholdType> {
        self.types
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SynthError::UnknownHouseholdType(name.to_string()))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HouseholdType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check every fallback resolves to a later-registered type.
    pub fn validate(&self) -> Result<()> {
        for (index, household_type) in self.types.iter().enumerate() {
            for spec in &household_type.members {
                for fallback in &spec.fallbacks {
                    match self.index_of(fallback) {
                        None => return Err(SynthError::UnknownHouseholdType(fallback.clone())),
                        Some(target) if target <= index => {
                            return Err(SynthError::InvalidHouseholdType {
                                name: household_type.name.clone(),
                                reason: format!(
                                    "fallback '{}' must be registered after it",
                                    fallback
                                ),
                            })
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Type of the same family with the given composition, if any.
    pub fn family_member(&self, family: &str, composition: (usize, usize)) -> Option<&HouseholdType> {
        self.types
            .iter()
            .find(|t| t.family.as_deref() == Some(family) && t.composition() == composition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_gap_labels() {
        assert_eq!(AgeGapBin::parse("1-4", 1.0).unwrap(), AgeGapBin { min: 1, max: 4, weight: 1.0 });
        assert_eq!(AgeGapBin::parse("-1-4", 1.0).unwrap(), AgeGapBin { min: -4, max: -1, weight: 1.0 });
        assert_eq!(AgeGapBin::parse("0-0", 2.0).unwrap(), AgeGapBin { min: 0, max: 0, weight: 2.0 });
        assert_eq!(AgeGapBin::parse("-20-100", 1.0).unwrap().min, -100);
        assert_eq!(AgeGapBin::parse("7", 1.0).unwrap().max, 7);
        assert!(AgeGapBin::parse("4-1", 1.0).is_err());
        assert!(AgeGapBin::parse("older", 1.0).is_err());
    }

    #[test]
    fn test_gap_sample_stays_in_bin() {
        let gaps = AgeGapDistribution::from_labels(&[("-1-4", 0.0), ("20-25", 1.0)]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let gap = gaps.sample(&mut rng).unwrap();
            assert!((20..=25).contains(&gap));
        }
        assert_eq!(AgeGapDistribution::default().sample(&mut rng), None);
    }

    #[test]
    fn test_negative_weight_rejected() {
        assert!(AgeGapDistribution::from_labels(&[("1-4", -1.0)]).is_err());
    }

    #[test]
    fn test_partner_conditioned_on_anchor() {
        let pairing = GenderPairing::new(vec![
            GenderPair { first: "male".into(), second: "female".into(), weight: 0.9 },
            GenderPair { first: "female".into(), second: "female".into(), weight: 0.1 },
        ])
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let draw = pairing.sample_partner("male", &mut rng).unwrap();
        assert_eq!(draw.gender, "female");
        assert!(draw.anchor_first);
        assert_eq!(pairing.partner_genders("female"), vec!["male", "female"]);
        assert!(pairing.sample_partner("other", &mut rng).is_none());
    }

    fn couple(name: &str, fallbacks: &[&str]) -> HouseholdType {
        HouseholdType::new(name).add_members(name, Role::Adult, 2, fallbacks)
    }

    #[test]
    fn test_type_shape_checks() {
        let child_only = HouseholdType::new("orphans").add_members::<&str>("orphan", Role::Child, 2, &[]);
        assert!(child_only.validate().is_err());
        let too_many = HouseholdType::new("commune").add_members::<&str>("commune", Role::Adult, 3, &[]);
        assert!(too_many.validate().is_err());
        let family = couple("married_with_1_children", &[])
            .add_members::<&str>("child_in_married_with_1_children", Role::Child, 1, &[]);
        assert_eq!(family.composition(), (2, 1));
        assert_eq!(family.size(), 3);
        assert_eq!(family.position_for(Role::Child), Some("child_in_married_with_1_children"));
    }

    #[test]
    fn test_catalog_fallback_order() {
        let single = HouseholdType::new("single").add_members::<&str>("single", Role::Adult, 1, &[]);
        assert!(HouseholdCatalog::from_types(vec![couple("married_no_children", &["single"]), single.clone()]).is_ok());

        let err = HouseholdCatalog::from_types(vec![single.clone(), couple("married_no_children", &["single"])])
            .unwrap_err();
        assert!(matches!(err, SynthError::InvalidHouseholdType { .. }));

        let err = HouseholdCatalog::from_types(vec![couple("married_no_children", &["nobody"])]).unwrap_err();
        assert_eq!(err, SynthError::UnknownHouseholdType("nobody".into()));

        let mut catalog = HouseholdCatalog::new();
        catalog.register(single.clone()).unwrap();
        assert!(catalog.register(single).is_err());
    }
}
