//! Results returned by the pipeline operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::attack::AttackParams;
use crate::backend::TrainingHistory;
use crate::metrics::{ClassificationReport, ConfusionMatrix, Metrics};
use crate::target::{SplitKind, TargetKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub target: TargetKind,
    pub augmented: bool,
    pub train_items: usize,
    pub validation_items: usize,
    /// `floor(train_items / batch_size)`.
    pub steps_train: usize,
    /// `floor(validation_items / batch_size)`.
    pub steps_valid: usize,
    pub history: TrainingHistory,
    pub descriptor_path: PathBuf,
    pub weights_path: PathBuf,
}

/// Point evaluation over a single batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub target: TargetKind,
    pub split: SplitKind,
    pub batch_items: usize,
    pub metrics: Metrics,
    pub report: ClassificationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub filename: String,
    pub label: String,
    pub probability: f32,
}

/// Per-file predictions with a confusion matrix against ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionTable {
    pub target: TargetKind,
    pub rows: Vec<PredictionRow>,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
    pub csv_path: PathBuf,
}

impl PredictionTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of one craft, retrain and evaluate cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdversarialReport {
    pub target: TargetKind,
    pub params: AttackParams,
    pub train_items: usize,
    pub validation_items: usize,
    /// Loaded model on the clean validation arrays.
    pub clean: Metrics,
    /// Loaded model on the adversarial validation arrays.
    pub undefended_accuracy: f32,
    /// Retrained model on the adversarial validation arrays.
    pub defended_accuracy: f32,
    pub retrain_history: TrainingHistory,
    /// Batch prediction of the persisted model on the test split.
    pub comparison: PredictionTable,
}
