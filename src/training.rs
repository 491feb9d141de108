use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
    train::{TrainStep, ValidStep},
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    backend::{EpochRecord, FitPlan, ModelBackend, TrainingHistory},
    batch::{collect_source, BatchSource, ImageBatch, InMemorySource},
    error::{PipelineError, Result},
    metrics::Metrics,
    model::{binary_cross_entropy_with_logits, Sample, SleepNet, SleepNetBatch, SleepNetBatcher, SleepNetConfig},
    store::ArtifactStore,
    target::TargetKind,
};

/// Images per forward pass when predicting or differentiating.
const INFERENCE_CHUNK: usize = 256;

/// A network together with the descriptor it was built from.
#[derive(Debug, Clone)]
pub struct TrainedModel<B: Backend> {
    pub config: SleepNetConfig,
    pub net: SleepNet<B>,
}

impl<B: Backend> TrainedModel<B> {
    fn ensure_input(&self, side: usize) -> Result<()> {
        if side == self.config.image_size {
            Ok(())
        } else {
            Err(PipelineError::shape_mismatch(
                format!("images of side {}", self.config.image_size),
                format!("images of side {side}"),
            ))
        }
    }
}

/// [`ModelBackend`] on burn: Adam, binary cross-entropy, full batches only.
#[derive(Debug, Clone)]
pub struct BurnBackend<B: AutodiffBackend> {
    device: B::Device,
}

impl<B: AutodiffBackend> BurnBackend<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn to_batch<BB: Backend>(&self, batch: &ImageBatch, device: &BB::Device) -> SleepNetBatch<BB> {
        let batcher = SleepNetBatcher::new(batch.side());
        Batcher::<BB, Sample, SleepNetBatch<BB>>::batch(&batcher, Sample::from_batch(batch), device)
    }

    fn validate(&self, model: &TrainedModel<B>, source: &dyn BatchSource, threshold: f32) -> Result<Option<Metrics>> {
        let steps = source.steps();
        if steps == 0 {
            return Ok(None);
        }

        let net = model.net.valid();
        let mut probabilities = Vec::with_capacity(steps * source.batch_size());
        let mut labels = Vec::with_capacity(steps * source.batch_size());
        for index in 0..steps {
            let batch = source.batch(index)?;
            let input = self.to_batch::<B::InnerBackend>(&batch, &self.device);
            let output = ValidStep::step(&net, input);
            probabilities.extend(values(output.probabilities)?);
            labels.extend_from_slice(batch.labels());
        }
        Ok(Some(Metrics::compute(&probabilities, &labels, threshold)))
    }
}

impl<B: AutodiffBackend> ModelBackend for BurnBackend<B> {
    type Model = TrainedModel<B>;

    fn build(&self, config: &SleepNetConfig) -> Result<Self::Model> {
        config.validate()?;
        info!(
            image_size = config.image_size,
            params = config.summary().total_params(),
            "building model"
        );
        Ok(TrainedModel {
            config: config.clone(),
            net: SleepNet::new(config, &self.device),
        })
    }

    fn fit(
        &self,
        model: Self::Model,
        train: &dyn BatchSource,
        validation: Option<&dyn BatchSource>,
        plan: &FitPlan,
    ) -> Result<(Self::Model, TrainingHistory)> {
        model.ensure_input(train.image_size())?;
        if let Some(validation) = validation {
            model.ensure_input(validation.image_size())?;
        }

        let steps = train.steps();
        if steps == 0 {
            warn!(items = train.len(), batch_size = train.batch_size(), "no full training batch, weights unchanged");
        }

        let TrainedModel { config, mut net } = model;
        let mut optim = AdamConfig::new().init::<B, SleepNet<B>>();
        let mut history = TrainingHistory::new();

        for epoch in 1..=plan.epochs {
            let mut probabilities = Vec::with_capacity(steps * train.batch_size());
            let mut labels = Vec::with_capacity(steps * train.batch_size());

            // Fresh order per epoch; items past the last full batch rotate in.
            let epoch_order = if steps == 0 {
                ImageBatch::empty(train.image_size())
            } else {
                let mut rng = StdRng::seed_from_u64(plan.seed.wrapping_add(epoch as u64));
                collect_source(train)?.shuffled(&mut rng)
            };
            let epoch_source = InMemorySource::new(epoch_order, train.batch_size());

            for index in 0..steps {
                let batch = epoch_source.batch(index)?;
                let input = self.to_batch::<B>(&batch, &self.device);
                let output = TrainStep::step(&net, input);

                probabilities.extend(values(output.item.probabilities)?);
                labels.extend_from_slice(batch.labels());
                net = optim.step(plan.learning_rate, net, output.grads);
                debug!(epoch, step = index + 1, steps, "train step");
            }

            let current = TrainedModel { config: config.clone(), net };
            let train_metrics = Metrics::compute(&probabilities, &labels, plan.threshold);
            let validation_metrics = match validation {
                Some(source) => self.validate(&current, source, plan.threshold)?,
                None => None,
            };
            net = current.net;

            info!(
                epoch,
                epochs = plan.epochs,
                loss = train_metrics.loss,
                accuracy = train_metrics.accuracy,
                val_loss = validation_metrics.map(|m| m.loss),
                val_accuracy = validation_metrics.map(|m| m.accuracy),
                "epoch finished"
            );
            history.push(EpochRecord {
                epoch,
                train: train_metrics,
                validation: validation_metrics,
            });
        }

        Ok((TrainedModel { config, net }, history))
    }

    fn predict(&self, model: &Self::Model, inputs: &ImageBatch) -> Result<Vec<f32>> {
        model.ensure_input(inputs.side())?;
        let net = model.net.valid();

        let mut probabilities = Vec::with_capacity(inputs.len());
        for start in (0..inputs.len()).step_by(INFERENCE_CHUNK) {
            let chunk = inputs.slice(start..start + INFERENCE_CHUNK);
            let input = self.to_batch::<B::InnerBackend>(&chunk, &self.device);
            probabilities.extend(values(net.predict(input.images))?);
        }
        Ok(probabilities)
    }

    fn input_gradient(
        &self,
        model: &Self::Model,
        inputs: &ImageBatch,
        labels: &[f32],
    ) -> Result<Vec<f32>> {
        model.ensure_input(inputs.side())?;
        let targeted = ImageBatch::new(inputs.side(), inputs.pixels().to_vec(), labels.to_vec())?;

        let input = self.to_batch::<B>(&targeted, &self.device);
        let images: Tensor<B, 4> = input.images.require_grad();
        let logits = model.net.forward(images.clone());
        let loss = binary_cross_entropy_with_logits(logits, input.targets);

        let grads = loss.backward();
        let gradient = images
            .grad(&grads)
            .ok_or_else(|| PipelineError::Tensor("input gradient was not tracked".to_string()))?;
        values(gradient)
    }

    fn save(&self, model: &Self::Model, store: &ArtifactStore, target: TargetKind) -> Result<()> {
        model.ensure_input(target.image_size())?;
        let descriptor = store.write_descriptor(target, &model.config)?;

        let stem = store.weights_stem(target);
        let recorder = CompactRecorder::new();
        let record = model.net.clone().into_record();
        Recorder::<B>::record(&recorder, record, stem.clone())
            .map_err(|e| PipelineError::recorder(&stem, e.to_string()))?;

        info!(
            target = %target,
            descriptor = %descriptor.display(),
            weights = %store.weights_path(target).display(),
            "model saved"
        );
        Ok(())
    }

    fn load(&self, store: &ArtifactStore, target: TargetKind) -> Result<Self::Model> {
        store.require_model(target)?;
        let config = store.read_descriptor(target)?;

        let stem = store.weights_stem(target);
        let net = SleepNet::<B>::new(&config, &self.device)
            .load_file(stem.clone(), &CompactRecorder::new(), &self.device)
            .map_err(|e| PipelineError::recorder(&stem, e.to_string()))?;

        info!(target = %target, image_size = config.image_size, "model loaded");
        Ok(TrainedModel { config, net })
    }
}

fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| PipelineError::Tensor(format!("{e:?}")))
}
