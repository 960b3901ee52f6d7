//! Per-stream seeding
//!
//! Each (stage, group) pair gets its own ChaCha stream derived from the base
//! seed, so a group's draws do not depend on which groups ran before it.

// FxHasher rather than DefaultHasher: DefaultHasher is not stable across
// Rust versions, which would change every synthetic population on upgrade.
use fxhash::FxHasher;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::hash::{Hash, Hasher};

/// Stream identifiers for the stages that draw random numbers.
pub mod stream {
    pub const ASSIGN: &str = "assign";
    pub const HOUSEHOLDS: &str = "households";
}

/// Mix `seed`, a stage label and a group key into a stream seed.
pub fn stream_seed(seed: u64, stage: &str, group: &str) -> u64 {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    stage.hash(&mut hasher);
    group.hash(&mut hasher);
    hasher.finish()
}

pub fn stream_rng(seed: u64, stage: &str, group: &str) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(stream_seed(seed, stage, group))
}
