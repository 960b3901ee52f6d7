use thiserror::Error;

/// Fatal conditions raised by the core.
///
/// Convergence shortfalls, rounding degradation and household-formation
/// leftovers are not errors; they are reported on the returned outcome
/// structs instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthError {
    #[error("Unknown dimension '{dimension}' (available: {available:?})")]
    UnknownDimension {
        dimension: String,
        available: Vec<String>,
    },

    #[error("Unknown category '{category}' for dimension '{dimension}'")]
    UnknownCategory { dimension: String, category: String },

    #[error("Duplicate dimension: {0}")]
    DuplicateDimension(String),

    #[error("Row arity mismatch: expected {expected} values, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("Invalid count {count} for cell {key:?}")]
    InvalidCount { key: Vec<String>, count: f64 },

    #[error("Unit {unit} has no attribute '{attribute}'")]
    MissingAttribute { unit: String, attribute: String },

    #[error("Unit {unit} already has attribute '{attribute}'")]
    AttributeAlreadySet { unit: String, attribute: String },

    #[error("Invalid value '{value}' for attribute '{attribute}'")]
    InvalidValue { attribute: String, value: String },

    #[error("Unknown household type: {0}")]
    UnknownHouseholdType(String),

    #[error("Invalid household type '{name}': {reason}")]
    InvalidHouseholdType { name: String, reason: String },

    #[error("Invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fit rejected for {context}: Z² {z_squared:.3} exceeds critical value {critical:.3}")]
    FitRejected {
        context: String,
        z_squared: f64,
        critical: f64,
    },
}

impl SynthError {
    /// Whether the caller has to fix its inputs (as opposed to a strict-mode
    /// statistical rejection, which may be retried with other settings).
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, SynthError::FitRejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, SynthError>;
