//! Capability interfaces between the pipeline controller and its
//! collaborators.
//!
//! The controller only sees these traits: [`ModelBackend`] trains, predicts,
//! differentiates and persists classifiers, [`AttackBackend`] perturbs
//! inputs. The burn implementation lives in [`crate::training`], the
//! gradient-sign attacks in [`crate::attack`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attack::AttackParams;
use crate::batch::{BatchSource, ImageBatch};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::SleepNetConfig;
use crate::store::ArtifactStore;
use crate::target::TargetKind;

/// Epoch budget and optimizer settings for one `fit` call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitPlan {
    pub epochs: usize,
    pub learning_rate: f64,
    pub threshold: f32,
    /// Epoch `e` trains on an order drawn from `seed + e`.
    pub seed: u64,
}

/// Metrics recorded at the end of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train: Metrics,
    pub validation: Option<Metrics>,
}

/// Per-epoch training and validation metrics of one `fit` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Series of one metric, e.g. `history.series(|m| m.loss)`.
    pub fn train_series(&self, pick: impl Fn(&Metrics) -> f32) -> Vec<f32> {
        self.epochs.iter().map(|e| pick(&e.train)).collect()
    }

    pub fn validation_series(&self, pick: impl Fn(&Metrics) -> f32) -> Vec<Option<f32>> {
        self.epochs
            .iter()
            .map(|e| e.validation.as_ref().map(&pick))
            .collect()
    }
}

impl fmt::Display for TrainingHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>5} {:>10} {:>10} {:>10} {:>10}",
            "epoch", "loss", "accuracy", "val_loss", "val_acc"
        )?;
        for e in &self.epochs {
            let (val_loss, val_acc) = e.validation.map_or_else(
                || ("-".to_string(), "-".to_string()),
                |v| (format!("{:.4}", v.loss), format!("{:.4}", v.accuracy)),
            );
            writeln!(
                f,
                "{:>5} {:>10.4} {:>10.4} {:>10} {:>10}",
                e.epoch, e.train.loss, e.train.accuracy, val_loss, val_acc
            )?;
        }
        Ok(())
    }
}

/// Train / predict / save / load / evaluate over the fixed architecture.
pub trait ModelBackend {
    /// Opaque classifier handle. Cloning yields an independent copy.
    type Model: Clone;

    /// Creates a freshly initialized model.
    fn build(&self, config: &SleepNetConfig) -> Result<Self::Model>;

    /// Trains on every full batch of `train` per epoch, scoring `validation`
    /// after each epoch when given. Returns a new model.
    fn fit(
        &self,
        model: Self::Model,
        train: &dyn BatchSource,
        validation: Option<&dyn BatchSource>,
        plan: &FitPlan,
    ) -> Result<(Self::Model, TrainingHistory)>;

    /// Sigmoid outputs, one per image.
    fn predict(&self, model: &Self::Model, inputs: &ImageBatch) -> Result<Vec<f32>>;

    /// Gradient of the summed loss with respect to every input pixel.
    fn input_gradient(
        &self,
        model: &Self::Model,
        inputs: &ImageBatch,
        labels: &[f32],
    ) -> Result<Vec<f32>>;

    /// Writes descriptor and weights for `target`, replacing older files.
    fn save(&self, model: &Self::Model, store: &ArtifactStore, target: TargetKind) -> Result<()>;

    /// Reads descriptor and weights for `target`.
    fn load(&self, store: &ArtifactStore, target: TargetKind) -> Result<Self::Model>;

    /// Scores `inputs` against their labels.
    fn evaluate(&self, model: &Self::Model, inputs: &ImageBatch, threshold: f32) -> Result<Metrics> {
        let probabilities = self.predict(model, inputs)?;
        Ok(Metrics::compute(&probabilities, inputs.labels(), threshold))
    }
}

/// Produces perturbed copies of clean inputs.
pub trait AttackBackend<M: ModelBackend> {
    /// Returns a batch with perturbed pixels and the original labels.
    fn craft(
        &self,
        backend: &M,
        model: &M::Model,
        inputs: &ImageBatch,
        params: &AttackParams,
    ) -> Result<ImageBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f32, accuracy: f32) -> Metrics {
        Metrics {
            loss,
            accuracy,
            ..Metrics::default()
        }
    }

    #[test]
    fn history_series() {
        let mut history = TrainingHistory::new();
        history.push(EpochRecord {
            epoch: 1,
            train: metrics(0.7, 0.5),
            validation: Some(metrics(0.6, 0.55)),
        });
        history.push(EpochRecord {
            epoch: 2,
            train: metrics(0.4, 0.8),
            validation: None,
        });

        assert_eq!(history.len(), 2);
        assert_eq!(history.train_series(|m| m.loss), vec![0.7, 0.4]);
        assert_eq!(history.validation_series(|m| m.accuracy), vec![Some(0.55), None]);
        assert_eq!(history.last().map(|e| e.epoch), Some(2));
    }

    #[test]
    fn history_table_marks_missing_validation() {
        let mut history = TrainingHistory::new();
        history.push(EpochRecord {
            epoch: 1,
            train: metrics(0.5, 0.75),
            validation: None,
        });
        let text = history.to_string();
        assert!(text.contains("val_loss"));
        assert!(text.contains("0.7500"));
        assert!(text.lines().nth(1).is_some_and(|l| l.contains('-')));
    }
}
