use crate::types::Rank;

pub type Result<T> = std::result::Result<T, GradwireError>;

#[derive(Debug, thiserror::Error)]
pub enum GradwireError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{component} is unavailable in this build")]
    Unavailable { component: &'static str },

    #[error("unknown reducer: {0}")]
    UnknownReducer(String),

    #[error("rank {rank} is invalid for a {rows}x{cols} matrix")]
    InvalidRank { rank: usize, rows: usize, cols: usize },

    #[error("sampling {wanted} singular values failed after {attempts} attempts")]
    SamplingExhausted { wanted: usize, attempts: usize },

    #[error("shape mismatch at tensor {index}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("buffer size mismatch: expected {expected} elements, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid root {root}: world size is {world_size}")]
    InvalidRoot { root: Rank, world_size: u32 },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },
}

impl GradwireError {
    /// Create an `InvalidConfig` error from any message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Length mismatch between two aligned gradient sequences.
    pub(crate) fn count_mismatch(expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            index: 0,
            expected: vec![expected],
            actual: vec![actual],
        }
    }
}
