//! # Synthesis Configuration
//!
//! Every tuning constant of the fitter, assigner, grouper and validator lives
//! here, so a pipeline can be described (and serialized) in one place.
//!
//! ```rust
//! use synthpop_core::config::SynthConfig;
//!
//! let config = SynthConfig::default();
//! let strict = SynthConfig::strict();
//! assert!(strict.validation.strict);
//! assert!(config.validated().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Result, SynthError};

/// Iterative proportional fitting limits.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FitConfig {
    /// Maximum relative deviation between any projection and its target
    #[validate(range(min = 0.0))]
    pub tolerance: f64,
    /// Iteration cap (one iteration = one sweep over all constraints)
    #[validate(range(min = 1))]
    pub max_iterations: usize,
    /// Stop early once the deviation changes by less than this per sweep
    #[validate(range(min = 0.0))]
    pub stall_tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 20_000,
            stall_tolerance: 1e-12,
        }
    }
}

/// Conditional attribute assignment settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssignConfig {
    /// Base seed; each (attribute, group) derives its own stream from it
    pub seed: u64,
    /// Allocate groups on the rayon pool. Results are identical either way.
    pub parallel: bool,
    /// Upper bound on single-agent moves per margin correction pass
    #[validate(range(min = 1))]
    pub max_correction_moves: usize,
    /// IPF settings for the per-group refinement against margins
    #[validate]
    pub refinement: FitConfig,
}

impl Default for AssignConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            parallel: false,
            max_correction_moves: 100_000,
            refinement: FitConfig {
                tolerance: 1e-4,
                max_iterations: 500,
                stall_tolerance: 1e-9,
            },
        }
    }
}

/// Household formation settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GroupingConfig {
    pub seed: u64,
    /// Attribute holding the household position each agent was assigned
    #[validate(length(min = 1))]
    pub position_attribute: String,
    #[validate(length(min = 1))]
    pub age_attribute: String,
    #[validate(length(min = 1))]
    pub gender_attribute: String,
    /// Attribute written onto agents once they join a household
    #[validate(length(min = 1))]
    pub household_id_attribute: String,
    pub household_id_prefix: String,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            position_attribute: "household_position".to_string(),
            age_attribute: "age".to_string(),
            gender_attribute: "gender".to_string(),
            household_id_attribute: "household_id".to_string(),
            household_id_prefix: "HH".to_string(),
        }
    }
}

/// Goodness-of-fit settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidationConfig {
    /// Expected counts (after scaling to the observed total) below this are zero
    #[validate(range(min = 0.0))]
    pub expected_floor: f64,
    /// One-sided standard normal quantile for the chi-square critical value
    #[validate(range(min = 0.0))]
    pub z_critical: f64,
    /// Turn failed fits into `SynthError::FitRejected`
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            expected_floor: 0.005,
            z_critical: 1.645,
            strict: cfg!(feature = "strict_contracts"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, Validate)]
pub struct SynthConfig {
    #[validate]
    pub fit: FitConfig,
    #[validate]
    pub assign: AssignConfig,
    #[validate]
    pub grouping: GroupingConfig,
    #[validate]
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl SynthConfig {
    /// Fails on any fit outside the critical value, tighter IPF tolerance.
    pub fn strict() -> Self {
        let mut cfg = Self::default();
        cfg.fit.tolerance = 1e-9;
        cfg.validation.strict = true;
        cfg.validation.z_critical = 2.326;
        cfg
    }

    /// Quick runs while exploring data: loose tolerance, parallel groups.
    pub fn exploratory() -> Self {
        let mut cfg = Self::default();
        cfg.fit.tolerance = 1e-3;
        cfg.fit.max_iterations = 1_000;
        cfg.assign.parallel = true;
        cfg.assign.refinement.max_iterations = 100;
        cfg
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.assign.seed = seed;
        self.grouping.seed = seed;
        self
    }

    /// Run the field validators and return the config if it passes.
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| SynthError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }
}

// ========== Tests ==========
