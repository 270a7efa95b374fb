//! Error types for the image-token decoder.

use thiserror::Error;

/// Errors produced while building or running a decoder.
#[derive(Debug, Error)]
pub enum DalleError {
    /// Configuration rejected before any weights are touched.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A weight, cache or input tensor has the wrong shape.
    #[error("Shape mismatch in {component}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        component: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Step {step} is out of range for {capacity} image token positions")]
    StepOutOfRange { step: usize, capacity: usize },

    #[error("Token {token} is out of range (max {max})")]
    TokenOutOfRange { token: u32, max: u32 },

    /// Guidance needs exactly one conditional and one unconditional row.
    #[error("Expected {expected} branches, got {actual}")]
    BranchCount { expected: usize, actual: usize },

    /// All sampling weights were zero or invalid.
    #[error("Degenerate sampling distribution at step {step}: {source}")]
    DegenerateDistribution {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Generation cancelled after {completed} of {total} tokens")]
    Cancelled { completed: usize, total: usize },

    /// A building block failed while decoding `step`.
    #[error("Decode step {step} failed: {source}")]
    Step {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl DalleError {
    pub fn shape(component: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        DalleError::ShapeMismatch {
            component: component.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Result type for decoder operations.
pub type DalleResult<T> = Result<T, DalleError>;
