//! # synthpop_core - Synthetic Population Engine
//!
//! Builds an individual-level population for a geographic area that is
//! statistically consistent with published marginal and joint distributions,
//! then groups the individuals into households.
//!
//! ## Features
//! - Iterative proportional fitting of seed tables to inconsistent margins
//! - Conditional attribute assignment with exact per-combination totals
//! - Household formation with partner/child matching and fallback types
//! - Continuity-corrected Z² goodness-of-fit scoring
//! - Deterministic: same seed, same population (independent of thread count)
//!
//! ## Pipeline
//! ```text
//! instantiate → fit → assign (× attributes) → group households
//!             → correct composition → enrich → validate
//! ```

// Doc formatting lints - purely cosmetic, fix incrementally
#![allow(clippy::doc_lazy_continuation)]
// Per-group allocation helpers carry many table views
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::needless_range_loop)]

pub mod assign;
pub mod config;
pub mod error;
pub mod fitting;
pub mod household;
pub mod population;
pub mod rng;
pub mod table;
pub mod validate;


pub use assign::{AssignReport, ConditionalAttributeAssigner, MarginResidual};
pub use config::{AssignConfig, FitConfig, GroupingConfig, SynthConfig, ValidationConfig};
pub use error::{Result, SynthError};
pub use fitting::{fit, Constraint, FitOutcome};
pub use household::{
    CompositionCorrector, CorrectionReport, GroupingOutcome, Household, HouseholdCatalog, HouseholdGrouper,
    HouseholdType, Member, Role,
};
pub use population::{crosstab, derive_attribute, instantiate, Agent, AgeBands, Unit};
pub use table::{CategoryRegistry, ContingencyTable, Key};
pub use validate::{FitReport, FitValidator, Scorecard};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
