use std::fmt;

use burn::{
    data::dataloader::batcher::Batcher,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    prelude::*,
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
    },
    train::{TrainOutput, TrainStep, ValidStep},
};
use serde::{Deserialize, Serialize};

use crate::batch::ImageBatch;
use crate::error::{PipelineError, Result};
use crate::target::TargetKind;

/// Architecture descriptor persisted next to the weights.
///
/// Only the input side depends on the target; the layer stack is fixed:
/// two 3x3 convolution + 2x2 average pool stages, flatten, two dense
/// hidden layers and one sigmoid unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepNetConfig {
    pub image_size: usize,
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub dense1_units: usize,
    pub dense2_units: usize,
}

impl SleepNetConfig {
    /// Smallest side that leaves one activation after both stages.
    pub const MIN_IMAGE_SIZE: usize = 10;

    #[must_use]
    pub const fn new(image_size: usize) -> Self {
        Self {
            image_size,
            conv1_filters: 6,
            conv2_filters: 16,
            kernel_size: 3,
            pool_size: 2,
            dense1_units: 120,
            dense2_units: 84,
        }
    }

    #[must_use]
    pub const fn for_target(target: TargetKind) -> Self {
        Self::new(target.image_size())
    }

    pub fn validate(&self) -> Result<()> {
        if *self != Self::new(self.image_size) {
            return Err(PipelineError::invalid_config(
                "architecture descriptor differs from the fixed layer stack",
            ));
        }
        if self.image_size < Self::MIN_IMAGE_SIZE {
            return Err(PipelineError::invalid_config(format!(
                "image size {} is below {}",
                self.image_size,
                Self::MIN_IMAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Spatial side after conv1, pool1, conv2 and pool2.
    #[must_use]
    pub const fn feature_sides(&self) -> [usize; 4] {
        let shrink = self.kernel_size.saturating_sub(1);
        let conv1 = self.image_size.saturating_sub(shrink);
        let pool1 = conv1 / self.pool_size;
        let conv2 = pool1.saturating_sub(shrink);
        let pool2 = conv2 / self.pool_size;
        [conv1, pool1, conv2, pool2]
    }

    #[must_use]
    pub const fn flattened_features(&self) -> usize {
        let side = self.feature_sides()[3];
        self.conv2_filters * side * side
    }

    /// Layer table in the order data flows through the network.
    #[must_use]
    pub fn summary(&self) -> ModelSummary {
        let [c1, p1, c2, p2] = self.feature_sides();
        let k = self.kernel_size * self.kernel_size;
        let flat = self.flattened_features();
        let layer = |name: &str, shape: Vec<usize>, params: usize| LayerSummary {
            name: name.to_string(),
            output_shape: shape,
            params,
        };
        ModelSummary {
            layers: vec![
                layer(
                    "conv2d_1",
                    vec![c1, c1, self.conv1_filters],
                    self.conv1_filters * k + self.conv1_filters,
                ),
                layer("average_pooling2d_1", vec![p1, p1, self.conv1_filters], 0),
                layer(
                    "conv2d_2",
                    vec![c2, c2, self.conv2_filters],
                    self.conv2_filters * self.conv1_filters * k + self.conv2_filters,
                ),
                layer("average_pooling2d_2", vec![p2, p2, self.conv2_filters], 0),
                layer("flatten", vec![flat], 0),
                layer(
                    "dense_1",
                    vec![self.dense1_units],
                    flat * self.dense1_units + self.dense1_units,
                ),
                layer(
                    "dense_2",
                    vec![self.dense2_units],
                    self.dense1_units * self.dense2_units + self.dense2_units,
                ),
                layer("dense_3", vec![1], self.dense2_units + 1),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub output_shape: Vec<usize>,
    pub params: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub layers: Vec<LayerSummary>,
}

impl ModelSummary {
    #[must_use]
    pub fn total_params(&self) -> usize {
        self.layers.iter().map(|l| l.params).sum()
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<22}{:<20}{:>10}", "Layer", "Output Shape", "Param #")?;
        for layer in &self.layers {
            let dims: Vec<String> = layer.output_shape.iter().map(ToString::to_string).collect();
            let shape = format!("(None, {})", dims.join(", "));
            writeln!(f, "{:<22}{:<20}{:>10}", layer.name, shape, layer.params)?;
        }
        write!(f, "Total params: {}", self.total_params())
    }
}

#[derive(Module, Debug)]
pub struct SleepNet<B: Backend> {
    conv1: Conv2d<B>,
    pool1: AvgPool2d,
    conv2: Conv2d<B>,
    pool2: AvgPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    output: Linear<B>,
    relu: Relu,
}

impl<B: Backend> SleepNet<B> {
    pub fn new(config: &SleepNetConfig, device: &B::Device) -> Self {
        let kernel = [config.kernel_size, config.kernel_size];
        let pool = || {
            AvgPool2dConfig::new([config.pool_size, config.pool_size])
                .with_strides([config.pool_size, config.pool_size])
                .init()
        };

        Self {
            conv1: Conv2dConfig::new([1, config.conv1_filters], kernel).init(device),
            pool1: pool(),
            conv2: Conv2dConfig::new([config.conv1_filters, config.conv2_filters], kernel)
                .init(device),
            pool2: pool(),
            fc1: LinearConfig::new(config.flattened_features(), config.dense1_units).init(device),
            fc2: LinearConfig::new(config.dense1_units, config.dense2_units).init(device),
            output: LinearConfig::new(config.dense2_units, 1).init(device),
            relu: Relu::new(),
        }
    }

    /// Logits of shape `[batch, 1]` for inputs `[batch, 1, side, side]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.conv1.forward(x));
        let x = self.pool1.forward(x);
        let x = self.relu.forward(self.conv2.forward(x));
        let x = self.pool2.forward(x);

        let x = x.flatten::<2>(1, 3);
        let x = self.relu.forward(self.fc1.forward(x));
        let x = self.relu.forward(self.fc2.forward(x));
        self.output.forward(x)
    }

    /// Sigmoid probabilities of the positive class.
    pub fn predict(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(x))
    }
}

/// Numerically stable binary cross-entropy on logits, averaged over the batch.
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let zeros = logits.zeros_like();
    let max_val = logits.clone().max_pair(zeros);

    let bce_term = max_val - logits.clone() * targets;
    let log_term = (logits.abs().neg().exp() + 1.0).log();

    (bce_term + log_term).mean()
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub pixels: Vec<f32>,
    pub label: f32,
}

impl Sample {
    /// Splits a batch into per-image samples.
    #[must_use]
    pub fn from_batch(batch: &ImageBatch) -> Vec<Self> {
        (0..batch.len())
            .map(|i| Self {
                pixels: batch.image(i).to_vec(),
                label: batch.labels()[i],
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SleepNetBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct SleepNetBatcher {
    pub image_size: usize,
}

impl SleepNetBatcher {
    pub const fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, Sample, SleepNetBatch<B>> for SleepNetBatcher {
    fn batch(&self, items: Vec<Sample>, device: &B::Device) -> SleepNetBatch<B> {
        let batch_size = items.len();
        let frame_size = self.image_size * self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * frame_size);
        let mut targets_data = Vec::with_capacity(batch_size);
        for item in &items {
            images_data.extend_from_slice(&item.pixels);
            targets_data.push(item.label);
        }

        let images = Tensor::<B, 1>::from_floats(&*images_data, device).reshape([
            batch_size,
            1,
            self.image_size,
            self.image_size,
        ]);
        let targets =
            Tensor::<B, 1>::from_floats(&*targets_data, device).reshape([batch_size, 1]);

        SleepNetBatch { images, targets }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub probabilities: Tensor<B, 2>,
    pub targets: Tensor<B, 2>,
}

impl<B: AutodiffBackend> TrainStep<SleepNetBatch<B>, BinaryOutput<B>> for SleepNet<B> {
    fn step(&self, batch: SleepNetBatch<B>) -> TrainOutput<BinaryOutput<B>> {
        let logits = self.forward(batch.images);
        let loss = binary_cross_entropy_with_logits(logits.clone(), batch.targets.clone());

        let grads = loss.backward();

        TrainOutput::new(
            self,
            grads,
            BinaryOutput {
                loss: loss.detach(),
                probabilities: sigmoid(logits.detach()),
                targets: batch.targets,
            },
        )
    }
}

impl<B: Backend> ValidStep<SleepNetBatch<B>, BinaryOutput<B>> for SleepNet<B> {
    fn step(&self, batch: SleepNetBatch<B>) -> BinaryOutput<B> {
        let logits = self.forward(batch.images);
        let loss = binary_cross_entropy_with_logits(logits.clone(), batch.targets.clone());

        BinaryOutput {
            loss,
            probabilities: sigmoid(logits),
            targets: batch.targets,
        }
    }
}
