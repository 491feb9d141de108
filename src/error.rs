//! Error types for the sleepnet pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::target::SplitKind;

/// Errors raised by the pipeline and its backends.
///
/// Every variant is terminal for the operation that raised it: the
/// controller neither retries nor returns partial results.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Target name outside `{eye, face}`.
    #[error("invalid target kind '{0}', accepted inputs: 'eye' or 'face'")]
    InvalidTargetKind(String),

    /// A load was requested before any save for this target.
    #[error("no persisted model for target '{target}' at {}", path.display())]
    ArtifactNotFound {
        /// Target name.
        target: String,
        /// Missing artifact file.
        path: PathBuf,
    },

    /// The split yields zero full batches.
    #[error("{split} split has {items} items, fewer than one batch of {batch_size}")]
    EmptySplit {
        /// Which split is degenerate.
        split: SplitKind,
        /// Items in the split.
        items: usize,
        /// Configured batch size.
        batch_size: usize,
    },

    /// Tensor dimensions disagree with the target's image size.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Batch index past the end of a source.
    #[error("batch {index} out of range, source has {count} batches")]
    BatchOutOfRange {
        /// Requested batch.
        index: usize,
        /// Batches available.
        count: usize,
    },

    /// Dataset directory is missing or holds no images.
    #[error("dataset directory {} is missing or empty", .0.display())]
    MissingDirectory(PathBuf),

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Image decoding failure.
    #[error("failed to decode image {}: {source}", path.display())]
    Image {
        /// Image file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: image::ImageError,
    },

    /// Weight record could not be written or read.
    #[error("model record error for {}: {reason}", path.display())]
    Recorder {
        /// Record file.
        path: PathBuf,
        /// Reason reported by the recorder.
        reason: String,
    },

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tensor data could not be read back from the backend.
    #[error("tensor data error: {0}")]
    Tensor(String),
}

impl PipelineError {
    /// Creates an artifact-not-found error.
    #[must_use]
    pub fn artifact_not_found(target: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::ArtifactNotFound {
            target: target.into(),
            path: path.into(),
        }
    }

    /// Creates an empty-split error.
    #[must_use]
    pub const fn empty_split(split: SplitKind, items: usize, batch_size: usize) -> Self {
        Self::EmptySplit {
            split,
            items,
            batch_size,
        }
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates an I/O error bound to a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a recorder error.
    #[must_use]
    pub fn recorder(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Recorder {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
