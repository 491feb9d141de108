//! The pipeline controller.
//!
//! Each operation is a single pass that stops at the first error. The
//! `run_*` entry points scan the dataset directories themselves; the `*_on`
//! variants take already built splits so callers (and tests) can supply
//! their own [`DatasetSplit`] implementations.

use std::path::Path;

use tracing::{info, warn};

use crate::attack::AttackParams;
use crate::backend::{AttackBackend, FitPlan, ModelBackend};
use crate::batch::{shape_string, BatchSource, ImageBatch, InMemorySource};
use crate::config::{AugmentationConfig, PipelineConfig};
use crate::data::{load_grayscale, materialize, ClassIndices, DatasetProvider, DatasetSplit};
use crate::error::{PipelineError, Result};
use crate::metrics::{classify, ClassificationReport, ConfusionMatrix, Metrics};
use crate::model::SleepNetConfig;
use crate::report::{AdversarialReport, Evaluation, PredictionRow, PredictionTable, TrainingReport};
use crate::store::ArtifactStore;
use crate::target::{SplitKind, TargetKind};

/// Drives train, persist, reload, evaluate and adversarial rounds for one
/// model backend and one attack backend.
///
/// Runs for different targets share nothing but the artifact store, which
/// is keyed by target. Two runs for the same target must not overlap.
pub struct Pipeline<M: ModelBackend, A: AttackBackend<M>> {
    backend: M,
    attacker: A,
    store: ArtifactStore,
    config: PipelineConfig,
}

impl<M: ModelBackend, A: AttackBackend<M>> Pipeline<M, A> {
    pub fn new(backend: M, attacker: A, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            attacker,
            store: ArtifactStore::new(&config.artifact_dir),
            config,
        })
    }

    pub fn backend(&self) -> &M {
        &self.backend
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Dataset provider for the configured root and augmentation toggle.
    pub fn provider(&self) -> DatasetProvider {
        DatasetProvider::new(&self.config)
    }

    /// Trains a fresh model on `<root>/train-<target>` and persists it.
    pub fn run_training(&self, target: TargetKind, augment: bool) -> Result<TrainingReport> {
        let splits = self
            .provider()
            .with_augmentation(AugmentationConfig::for_toggle(augment))
            .collect(target)?;
        self.train_on(target, &splits.train, &splits.validation, augment)
    }

    /// Trains on the given splits for the configured epoch budget, then
    /// overwrites the target's artifacts and history.
    ///
    /// Both splits must yield at least one full batch.
    pub fn train_on<T, V>(
        &self,
        target: TargetKind,
        train: &T,
        validation: &V,
        augmented: bool,
    ) -> Result<TrainingReport>
    where
        T: DatasetSplit,
        V: DatasetSplit,
    {
        ensure_split_side(target, train)?;
        ensure_split_side(target, validation)?;

        let steps_train = require_steps(train)?;
        let steps_valid = require_steps(validation)?;
        info!(
            target = %target,
            augmented,
            train = train.len(),
            validation = validation.len(),
            steps_train,
            steps_valid,
            "starting training"
        );

        let model = self.backend.build(&SleepNetConfig::for_target(target))?;
        let plan = FitPlan {
            epochs: self.config.num_epochs,
            learning_rate: self.config.learning_rate,
            threshold: self.config.threshold,
            seed: self.config.seed,
        };
        let (model, history) = self.backend.fit(model, train, Some(validation), &plan)?;

        self.backend.save(&model, &self.store, target)?;
        self.store.write_history(target, &history)?;

        if let Some(last) = history.last() {
            info!(target = %target, final_train = %last.train, "training finished");
        }

        Ok(TrainingReport {
            target,
            augmented,
            train_items: train.len(),
            validation_items: validation.len(),
            steps_train,
            steps_valid,
            history,
            descriptor_path: self.store.descriptor_path(target),
            weights_path: self.store.weights_path(target),
        })
    }

    /// Scores the persisted model on the first batch of `split`.
    pub fn run_evaluation(&self, target: TargetKind, split: SplitKind) -> Result<Evaluation> {
        self.store.require_model(target)?;
        let splits = self.provider().collect(target)?;
        self.evaluate_on(target, splits.get(split))
    }

    /// Point evaluation over one batch; no aggregation across batches.
    pub fn evaluate_on<S: DatasetSplit>(&self, target: TargetKind, split: &S) -> Result<Evaluation> {
        let model = self.backend.load(&self.store, target)?;
        ensure_split_side(target, split)?;
        if split.batch_count() == 0 {
            return Err(PipelineError::empty_split(
                split.kind(),
                split.len(),
                split.batch_size(),
            ));
        }

        let batch = split.batch(0)?;
        let probabilities = self.backend.predict(&model, &batch)?;
        let metrics = Metrics::compute(&probabilities, batch.labels(), self.config.threshold);

        let truth: Vec<u8> = batch.labels().iter().map(|&l| u8::from(l >= 0.5)).collect();
        let predicted: Vec<u8> = probabilities
            .iter()
            .map(|&p| classify(p, self.config.threshold))
            .collect();
        let report = ClassificationReport::from_labels(&truth, &predicted, split.class_indices().names());

        info!(target = %target, split = %split.kind(), images = batch.len(), metrics = %metrics, "evaluated");
        Ok(Evaluation {
            target,
            split: split.kind(),
            batch_items: batch.len(),
            metrics,
            report,
        })
    }

    /// Predicts every full batch of `split` with the persisted model and
    /// writes `results-<target>.csv`.
    pub fn run_batch_prediction(&self, target: TargetKind, split: SplitKind) -> Result<PredictionTable> {
        self.store.require_model(target)?;
        let splits = self.provider().collect(target)?;
        self.predict_on(target, splits.train.class_indices(), splits.get(split))
    }

    /// Labels are named through `classes`, the training split's table.
    pub fn predict_on<S: DatasetSplit>(
        &self,
        target: TargetKind,
        classes: &ClassIndices,
        split: &S,
    ) -> Result<PredictionTable> {
        let model = self.backend.load(&self.store, target)?;
        self.predict_with(&model, target, classes, split)
    }

    fn predict_with<S: DatasetSplit>(
        &self,
        model: &M::Model,
        target: TargetKind,
        classes: &ClassIndices,
        split: &S,
    ) -> Result<PredictionTable> {
        ensure_split_side(target, split)?;
        let steps = require_steps(split)?;
        let filenames = split.filenames();
        let truth_all = split.classes();

        let mut rows = Vec::with_capacity(steps * split.batch_size());
        let mut truth = Vec::with_capacity(rows.capacity());
        let mut predicted = Vec::with_capacity(rows.capacity());
        for index in 0..steps {
            let batch = split.batch(index)?;
            let probabilities = self.backend.predict(model, &batch)?;
            for (offset, &probability) in probabilities.iter().enumerate() {
                let position = index * split.batch_size() + offset;
                let label = classify(probability, self.config.threshold);
                let name = classes.name_of(label).ok_or_else(|| {
                    PipelineError::invalid_config(format!(
                        "label {label} has no class name in the training split"
                    ))
                })?;
                let filename = filenames.get(position).cloned().ok_or_else(|| {
                    PipelineError::shape_mismatch(
                        format!("{} file names", position + 1),
                        format!("{} file names", filenames.len()),
                    )
                })?;

                rows.push(PredictionRow {
                    filename,
                    label: name.to_string(),
                    probability,
                });
                truth.push(truth_all.get(position).copied().unwrap_or_default());
                predicted.push(label);
            }
        }

        let confusion = ConfusionMatrix::new(&truth, &predicted, classes.len().max(2));
        let report = ClassificationReport::from_confusion(&confusion, classes.names());
        let mut table = PredictionTable {
            target,
            rows,
            confusion,
            report,
            csv_path: self.store.results_path(target),
        };
        table.csv_path = self.store.write_predictions(target, &table)?;

        info!(
            target = %target,
            split = %split.kind(),
            rows = table.len(),
            accuracy = table.report.accuracy,
            "batch prediction finished"
        );
        Ok(table)
    }

    /// Load, craft, retrain and evaluate. The retrained model is discarded.
    pub fn run_adversarial_round(
        &self,
        target: TargetKind,
        params: &AttackParams,
    ) -> Result<AdversarialReport> {
        self.store.require_model(target)?;
        let splits = self.provider().collect(target)?;
        self.adversarial_round_on(target, params, &splits.train, &splits.validation, &splits.test)
    }

    pub fn adversarial_round_on<T, V, S>(
        &self,
        target: TargetKind,
        params: &AttackParams,
        train: &T,
        validation: &V,
        test: &S,
    ) -> Result<AdversarialReport>
    where
        T: DatasetSplit,
        V: DatasetSplit,
        S: DatasetSplit,
    {
        // Load
        let model = self.backend.load(&self.store, target)?;
        info!(target = %target, method = %params.method, "adversarial round: model loaded");

        // Craft
        let train_clean = materialize_checked(target, train)?;
        let valid_clean = materialize_checked(target, validation)?;
        let clean = self
            .backend
            .evaluate(&model, &valid_clean, self.config.threshold)?;

        let train_adv = self.attacker.craft(&self.backend, &model, &train_clean, params)?;
        let valid_adv = self.attacker.craft(&self.backend, &model, &valid_clean, params)?;
        ensure_crafted(&train_clean, &train_adv)?;
        ensure_crafted(&valid_clean, &valid_adv)?;
        let undefended_accuracy = self
            .backend
            .evaluate(&model, &valid_adv, self.config.threshold)?
            .accuracy;
        info!(
            target = %target,
            clean_accuracy = clean.accuracy,
            undefended_accuracy,
            "adversarial round: inputs crafted"
        );

        // Retrain
        let (fit_part, holdout) = train_adv.split_tail(self.config.retrain_validation_split);
        let fit_source = InMemorySource::new(fit_part, self.config.retrain_batch_size);
        let holdout_source = InMemorySource::new(holdout, self.config.retrain_batch_size);
        if fit_source.steps() == 0 {
            return Err(PipelineError::empty_split(
                SplitKind::Train,
                fit_source.len(),
                fit_source.batch_size(),
            ));
        }
        if holdout_source.steps() == 0 {
            warn!(
                items = holdout_source.len(),
                batch_size = holdout_source.batch_size(),
                "retraining holdout has no full batch, validation metrics skipped"
            );
        }
        let plan = FitPlan {
            epochs: self.config.retrain_epochs,
            learning_rate: self.config.learning_rate,
            threshold: self.config.threshold,
            seed: self.config.seed,
        };
        let (retrained, retrain_history) =
            self.backend
                .fit(model.clone(), &fit_source, Some(&holdout_source), &plan)?;

        // Evaluate
        let defended_accuracy = self
            .backend
            .evaluate(&retrained, &valid_adv, self.config.threshold)?
            .accuracy;
        info!(
            target = %target,
            undefended_accuracy,
            defended_accuracy,
            "adversarial round: retrained model evaluated"
        );
        let comparison = self.predict_with(&model, target, train.class_indices(), test)?;

        Ok(AdversarialReport {
            target,
            params: *params,
            train_items: train_clean.len(),
            validation_items: valid_clean.len(),
            clean,
            undefended_accuracy,
            defended_accuracy,
            retrain_history,
            comparison,
        })
    }

    /// Classifies one image file with the persisted model.
    pub fn predict_single_image(
        &self,
        target: TargetKind,
        classes: &ClassIndices,
        path: &Path,
    ) -> Result<PredictionRow> {
        let model = self.backend.load(&self.store, target)?;
        let side = target.image_size();
        let pixels = load_grayscale(path, side)?;
        let input = ImageBatch::new(side, pixels, vec![0.0])?;

        let probability = self
            .backend
            .predict(&model, &input)?
            .first()
            .copied()
            .ok_or_else(|| PipelineError::Tensor("no prediction returned".to_string()))?;
        let label = classify(probability, self.config.threshold);
        let name = classes.name_of(label).unwrap_or(if label == 1 { "positive" } else { "negative" });

        info!(target = %target, path = %path.display(), probability, label = name, "single prediction");
        Ok(PredictionRow {
            filename: path.display().to_string(),
            label: name.to_string(),
            probability,
        })
    }
}

fn ensure_split_side<S: DatasetSplit>(target: TargetKind, split: &S) -> Result<()> {
    if split.image_size() == target.image_size() {
        Ok(())
    } else {
        Err(PipelineError::shape_mismatch(
            shape_string(split.len(), target.image_size()),
            shape_string(split.len(), split.image_size()),
        ))
    }
}

/// `floor(len / batch_size)`, or `EmptySplit` when that is zero.
fn require_steps<S: DatasetSplit>(split: &S) -> Result<usize> {
    match split.steps() {
        0 => Err(PipelineError::empty_split(
            split.kind(),
            split.len(),
            split.batch_size(),
        )),
        steps => Ok(steps),
    }
}

fn materialize_checked<S: DatasetSplit>(target: TargetKind, split: &S) -> Result<ImageBatch> {
    ensure_split_side(target, split)?;
    let arrays = materialize(split)?;
    if arrays.is_empty() {
        return Err(PipelineError::empty_split(split.kind(), 0, split.batch_size()));
    }
    arrays.ensure_side(target.image_size())?;
    Ok(arrays)
}

fn ensure_crafted(clean: &ImageBatch, crafted: &ImageBatch) -> Result<()> {
    crafted.ensure_side(clean.side())?;
    if crafted.len() == clean.len() {
        Ok(())
    } else {
        Err(PipelineError::shape_mismatch(
            shape_string(clean.len(), clean.side()),
            shape_string(crafted.len(), crafted.side()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;
    use crate::backend::{EpochRecord, TrainingHistory};
    use crate::data::MemorySplit;

    /// Predicts the mean pixel value plus a bias.
    #[derive(Debug, Clone, PartialEq)]
    struct MeanModel {
        side: usize,
        bias: f32,
    }

    #[derive(Default)]
    struct MeanBackend {
        fits: Cell<usize>,
    }

    impl ModelBackend for MeanBackend {
        type Model = MeanModel;

        fn build(&self, config: &SleepNetConfig) -> Result<Self::Model> {
            Ok(MeanModel {
                side: config.image_size,
                bias: 0.0,
            })
        }

        fn fit(
            &self,
            model: Self::Model,
            train: &dyn BatchSource,
            _validation: Option<&dyn BatchSource>,
            plan: &FitPlan,
        ) -> Result<(Self::Model, TrainingHistory)> {
            self.fits.set(self.fits.get() + 1);
            assert!(train.steps() > 0);
            let mut history = TrainingHistory::new();
            for epoch in 1..=plan.epochs {
                history.push(EpochRecord {
                    epoch,
                    train: Metrics::default(),
                    validation: None,
                });
            }
            Ok((
                MeanModel {
                    bias: model.bias + 0.01,
                    ..model
                },
                history,
            ))
        }

        fn predict(&self, model: &Self::Model, inputs: &ImageBatch) -> Result<Vec<f32>> {
            inputs.ensure_side(model.side)?;
            Ok((0..inputs.len())
                .map(|i| {
                    let image = inputs.image(i);
                    (image.iter().sum::<f32>() / image.len() as f32 + model.bias).clamp(0.0, 1.0)
                })
                .collect())
        }

        fn input_gradient(
            &self,
            _model: &Self::Model,
            inputs: &ImageBatch,
            _labels: &[f32],
        ) -> Result<Vec<f32>> {
            Ok(vec![0.0; inputs.pixels().len()])
        }

        fn save(&self, model: &Self::Model, store: &ArtifactStore, target: TargetKind) -> Result<()> {
            store.write_descriptor(target, &SleepNetConfig::for_target(target))?;
            let path = store.weights_path(target);
            fs::write(&path, model.bias.to_string()).map_err(|e| PipelineError::io(&path, e))
        }

        fn load(&self, store: &ArtifactStore, target: TargetKind) -> Result<Self::Model> {
            store.require_model(target)?;
            let config = store.read_descriptor(target)?;
            let path = store.weights_path(target);
            let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
            Ok(MeanModel {
                side: config.image_size,
                bias: text.parse().unwrap_or_default(),
            })
        }
    }

    /// Inverts every pixel.
    #[derive(Default)]
    struct InvertAttack {
        calls: Cell<usize>,
    }

    impl AttackBackend<MeanBackend> for InvertAttack {
        fn craft(
            &self,
            _backend: &MeanBackend,
            _model: &MeanModel,
            inputs: &ImageBatch,
            _params: &AttackParams,
        ) -> Result<ImageBatch> {
            self.calls.set(self.calls.get() + 1);
            inputs.with_pixels(inputs.pixels().iter().map(|x| 1.0 - x).collect())
        }
    }

    fn classes() -> ClassIndices {
        ClassIndices::new(["closed", "open"])
    }

    /// Alternating closed (dark) and open (bright) images.
    fn split(kind: SplitKind, side: usize, items: usize, batch_size: usize) -> MemorySplit {
        let mut pixels = Vec::new();
        let mut labels = Vec::new();
        let mut names = Vec::new();
        for i in 0..items {
            let open = i % 2 == 1;
            pixels.extend(std::iter::repeat(if open { 0.9 } else { 0.1 }).take(side * side));
            labels.push(if open { 1.0 } else { 0.0 });
            names.push(format!("{}/{i:03}.png", if open { "open" } else { "closed" }));
        }
        let data = ImageBatch::new(side, pixels, labels).unwrap();
        MemorySplit::new(kind, data, batch_size, names, classes()).unwrap()
    }

    fn pipeline(dir: &Path) -> Pipeline<MeanBackend, InvertAttack> {
        let config = PipelineConfig {
            artifact_dir: dir.to_path_buf(),
            batch_size: 4,
            num_epochs: 2,
            retrain_batch_size: 2,
            ..PipelineConfig::default()
        };
        Pipeline::new(MeanBackend::default(), InvertAttack::default(), config).unwrap()
    }

    fn trained(dir: &Path) -> Pipeline<MeanBackend, InvertAttack> {
        let pipeline = pipeline(dir);
        pipeline
            .train_on(
                TargetKind::Eye,
                &split(SplitKind::Train, 24, 8, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                false,
            )
            .unwrap();
        pipeline
    }

    #[test]
    fn training_then_evaluation_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let report = pipeline
            .train_on(
                TargetKind::Eye,
                &split(SplitKind::Train, 24, 9, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                false,
            )
            .unwrap();
        assert_eq!(report.steps_train, 2);
        assert_eq!(report.steps_valid, 1);
        assert_eq!(report.history.len(), 2);
        assert!(pipeline.store().history_path(TargetKind::Eye).is_file());

        let evaluation = pipeline
            .evaluate_on(TargetKind::Eye, &split(SplitKind::Validation, 24, 6, 4))
            .unwrap();
        assert_eq!(evaluation.batch_items, 4);
        assert!((evaluation.metrics.accuracy - 1.0).abs() < 1e-6);
        assert_eq!(evaluation.report.classes.len(), 2);
        assert!(evaluation.report.to_string().contains("closed"));
    }

    #[test]
    fn every_target_survives_save_and_load() {
        for target in TargetKind::ALL {
            let dir = tempfile::tempdir().unwrap();
            let pipeline = pipeline(dir.path());
            let side = target.image_size();

            pipeline
                .train_on(
                    target,
                    &split(SplitKind::Train, side, 8, 4),
                    &split(SplitKind::Validation, side, 4, 4),
                    false,
                )
                .unwrap();
            assert!(pipeline.store().has_model(target));

            let evaluation = pipeline
                .evaluate_on(target, &split(SplitKind::Validation, side, 4, 4))
                .unwrap();
            assert_eq!(evaluation.target, target);
            assert!((evaluation.metrics.accuracy - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn run_training_forwards_augmentation_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        for (class, value) in [("closed", 30u8), ("open", 220u8)] {
            for (dir_name, count) in [("train-eye", 10), ("test-eye", 1)] {
                for i in 0..count {
                    let path = root.join(format!("{dir_name}/{class}/{i:03}.png"));
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    image::GrayImage::from_fn(24, 24, |x, _| {
                        image::Luma([value.saturating_add(x as u8)])
                    })
                    .save(&path)
                    .unwrap();
                }
            }
        }
        let config = PipelineConfig {
            dataset_root: root,
            artifact_dir: dir.path().join("artifacts"),
            batch_size: 4,
            num_epochs: 1,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(MeanBackend::default(), InvertAttack::default(), config).unwrap();

        let report = pipeline.run_training(TargetKind::Eye, true).unwrap();
        assert!(report.augmented);
        assert_eq!(report.train_items, 16);
        assert_eq!(report.steps_train, 4);
        assert_eq!(report.steps_valid, 1);
        assert!(pipeline.store().has_model(TargetKind::Eye));
    }

    #[test]
    fn loaded_model_rejects_foreign_image_side() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = trained(dir.path());
        let face_sized = || split(SplitKind::Validation, 100, 4, 4);

        assert!(matches!(
            pipeline.evaluate_on(TargetKind::Eye, &face_sized()),
            Err(PipelineError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            pipeline.predict_on(TargetKind::Eye, &classes(), &split(SplitKind::Test, 100, 2, 1)),
            Err(PipelineError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            pipeline.adversarial_round_on(
                TargetKind::Eye,
                &AttackParams::fgsm(),
                &split(SplitKind::Train, 100, 10, 4),
                &face_sized(),
                &split(SplitKind::Test, 24, 2, 1),
            ),
            Err(PipelineError::ShapeMismatch { .. })
        ));
        assert_eq!(pipeline.attacker.calls.get(), 0);
        assert!(!pipeline.store().results_path(TargetKind::Eye).exists());
    }

    #[test]
    fn training_split_one_short_of_a_batch_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let err = pipeline
            .train_on(
                TargetKind::Eye,
                &split(SplitKind::Train, 24, 3, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmptySplit {
                split: SplitKind::Train,
                items: 3,
                batch_size: 4
            }
        ));
        assert_eq!(pipeline.backend().fits.get(), 0);
        assert!(!pipeline.store().has_model(TargetKind::Eye));
    }

    #[test]
    fn validation_without_full_batch_stops_before_fit() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let err = pipeline
            .train_on(
                TargetKind::Eye,
                &split(SplitKind::Train, 24, 8, 4),
                &split(SplitKind::Validation, 24, 2, 4),
                false,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::EmptySplit {
                split: SplitKind::Validation,
                ..
            }
        ));
        assert_eq!(pipeline.backend().fits.get(), 0);
    }

    #[test]
    fn wrong_image_side_is_a_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let err = pipeline
            .train_on(
                TargetKind::Face,
                &split(SplitKind::Train, 24, 8, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn evaluation_without_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let err = pipeline
            .evaluate_on(TargetKind::Eye, &split(SplitKind::Validation, 24, 4, 4))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound { .. }));
    }

    #[test]
    fn batch_prediction_lists_every_test_file() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = trained(dir.path());
        let test = split(SplitKind::Test, 24, 5, 1);

        let table = pipeline.predict_on(TargetKind::Eye, &classes(), &test).unwrap();
        assert_eq!(table.len(), 5);
        let filenames: Vec<&str> = table.rows.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(filenames, test.filenames().iter().map(String::as_str).collect::<Vec<_>>());
        assert!(table.rows.iter().all(|r| r.label == "open" || r.label == "closed"));
        assert_eq!(table.rows[0].label, "closed");
        assert_eq!(table.rows[1].label, "open");
        assert_eq!(table.confusion.correct(), 5);

        let csv = fs::read_to_string(&table.csv_path).unwrap();
        assert_eq!(csv.lines().count(), 6);
        assert!(csv.starts_with("Filename,Predictions\n"));
    }

    #[test]
    fn adversarial_round_fails_fast_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let err = pipeline
            .adversarial_round_on(
                TargetKind::Eye,
                &AttackParams::pgd(),
                &split(SplitKind::Train, 24, 10, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                &split(SplitKind::Test, 24, 2, 1),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotFound { .. }));
        assert_eq!(pipeline.attacker.calls.get(), 0);
    }

    #[test]
    fn adversarial_round_reports_and_keeps_persisted_model() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = trained(dir.path());
        let weights = pipeline.store().weights_path(TargetKind::Eye);
        let before = fs::read_to_string(&weights).unwrap();
        let fits_before = pipeline.backend().fits.get();

        let report = pipeline
            .adversarial_round_on(
                TargetKind::Eye,
                &AttackParams::fgsm(),
                &split(SplitKind::Train, 24, 10, 4),
                &split(SplitKind::Validation, 24, 4, 4),
                &split(SplitKind::Test, 24, 3, 1),
            )
            .unwrap();

        assert_eq!(pipeline.attacker.calls.get(), 2);
        assert_eq!(pipeline.backend().fits.get(), fits_before + 1);
        assert_eq!(report.train_items, 10);
        assert_eq!(report.validation_items, 4);
        assert!((report.clean.accuracy - 1.0).abs() < 1e-6);
        assert!(report.undefended_accuracy.abs() < 1e-6);
        assert_eq!(report.retrain_history.len(), 10);
        assert_eq!(report.comparison.len(), 3);
        assert_eq!(report.params.method, crate::attack::AttackMethod::Fgsm);

        assert_eq!(fs::read_to_string(&weights).unwrap(), before);
    }

    #[test]
    fn single_image_prediction_uses_class_names() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = trained(dir.path());
        let path = dir.path().join("probe.png");
        image::GrayImage::from_pixel(40, 40, image::Luma([250u8]))
            .save(&path)
            .unwrap();

        let row = pipeline
            .predict_single_image(TargetKind::Eye, &classes(), &path)
            .unwrap();
        assert_eq!(row.label, "open");
        assert!(row.probability > 0.9);
    }
}
