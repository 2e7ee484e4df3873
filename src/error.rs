use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reassembling an instance batch into volumes.
///
/// Per-instance and per-series failures (`UnreadableInstance`,
/// `Registration`) are absorbed and logged where they occur; the remaining
/// variants abort the conversion call.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no usable instances in batch")]
    InsufficientData,

    #[error("acquisition structure violates the '{plan}' plan: {reason}")]
    StructureMismatch { plan: String, reason: String },

    #[error("interleave stride does not partition the batch: {0}")]
    DemuxMismatch(String),

    #[error("volume extents differ: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("unreadable instance {path}: {reason}")]
    UnreadableInstance { path: PathBuf, reason: String },

    #[error("unsupported sequence '{tag}', supported: {supported}")]
    UnsupportedSequence { tag: String, supported: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Shape-mismatch constructor used by every joining/elementwise site.
    pub(crate) fn shapes(left: &[usize], right: &[usize]) -> Self {
        ConvertError::ShapeMismatch {
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}
