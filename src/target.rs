//! Classifier targets and dataset split names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Which classifier a pipeline run concerns.
///
/// The target fixes the square image side for every tensor of the run,
/// the dataset directory names and the artifact file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Eye state classifier (open / closed).
    Eye,
    /// Face classifier.
    Face,
}

impl TargetKind {
    /// Every target.
    pub const ALL: [Self; 2] = [Self::Eye, Self::Face];

    /// Lowercase name used in file names.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Eye => "eye",
            Self::Face => "face",
        }
    }

    /// Side length of the square grayscale input.
    pub const fn image_size(&self) -> usize {
        match self {
            Self::Eye => 24,
            Self::Face => 100,
        }
    }

    pub fn train_dir(&self) -> String {
        format!("train-{}", self.name())
    }

    pub fn test_dir(&self) -> String {
        format!("test-{}", self.name())
    }

    /// Artifact stem shared by the descriptor and weight files.
    pub fn model_stem(&self) -> String {
        format!("model-{}", self.name())
    }

    pub fn results_file(&self) -> String {
        format!("results-{}.csv", self.name())
    }

    pub fn history_file(&self) -> String {
        format!("history-{}.json", self.name())
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eye" => Ok(Self::Eye),
            "face" => Ok(Self::Face),
            other => Err(PipelineError::InvalidTargetKind(other.to_string())),
        }
    }
}

/// One named partition of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

impl SplitKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
