//! Train, persist, reload, evaluate and adversarially probe small
//! grayscale CNN classifiers for eye state and faces.

pub mod attack;
pub mod augment;
pub mod backend;
pub mod batch;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod target;
pub mod training;

pub use attack::{AttackMethod, AttackParams, GradientAttack};
pub use backend::{AttackBackend, FitPlan, ModelBackend, TrainingHistory};
pub use batch::{BatchSource, ImageBatch, InMemorySource};
pub use config::{AugmentationConfig, PipelineConfig};
pub use data::{ClassIndices, DatasetProvider, DatasetSplit, ImageFolderSplit, MemorySplit, Splits};
pub use error::{PipelineError, Result};
pub use metrics::{ClassificationReport, ConfusionMatrix, Metrics};
pub use model::{SleepNet, SleepNetConfig};
pub use pipeline::Pipeline;
pub use report::{AdversarialReport, Evaluation, PredictionRow, PredictionTable, TrainingReport};
pub use store::ArtifactStore;
pub use target::{SplitKind, TargetKind};
pub use training::{BurnBackend, TrainedModel};
