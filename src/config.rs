use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attack::AttackMethod;
use crate::error::{PipelineError, Result};
use crate::target::TargetKind;

/// Random affine augmentation ranges applied by the dataset provider.
///
/// Shear is an angle in radians; shifts and zoom are fractions of the
/// image side; rotation is in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentationConfig {
    pub rotation_range: f32,
    pub width_shift_range: f32,
    pub height_shift_range: f32,
    pub shear_range: f32,
    pub zoom_range: f32,
    pub horizontal_flip: bool,
}

impl AugmentationConfig {
    /// No augmentation at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
        }
    }

    /// Ranges used when augmentation is switched on.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            rotation_range: 40.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }

    /// Picks the table for an augmentation toggle.
    #[must_use]
    pub const fn for_toggle(augment: bool) -> Self {
        if augment {
            Self::standard()
        } else {
            Self::none()
        }
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        *self == Self::none()
    }
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset_root: PathBuf,
    pub artifact_dir: PathBuf,
    pub targets: Vec<TargetKind>,
    pub attacks: Vec<AttackMethod>,
    pub augment: bool,
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub validation_split: f64,
    pub seed: u64,
    pub threshold: f32,
    pub retrain_epochs: usize,
    pub retrain_batch_size: usize,
    pub retrain_validation_split: f64,
    pub attack_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("dataset"),
            artifact_dir: PathBuf::from("."),
            targets: vec![TargetKind::Eye],
            attacks: vec![AttackMethod::Pgd],
            augment: false,
            batch_size: 32,
            test_batch_size: 1,
            num_epochs: 4,
            learning_rate: 0.001,
            validation_split: 0.2,
            seed: 42,
            threshold: 0.5,
            retrain_epochs: 10,
            retrain_batch_size: 5,
            retrain_validation_split: 0.2,
            attack_batch_size: 32,
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config; missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let raw: Value = serde_json::from_reader(BufReader::new(file))?;
        check_target_names(&raw)?;
        let config: Self = serde_json::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    #[must_use]
    pub const fn augmentation(&self) -> AugmentationConfig {
        AugmentationConfig::for_toggle(self.augment)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(PipelineError::invalid_config("batch size must be > 0"));
        }
        if self.retrain_batch_size == 0 || self.attack_batch_size == 0 {
            return Err(PipelineError::invalid_config(
                "retrain and attack batch sizes must be > 0",
            ));
        }
        if self.num_epochs == 0 || self.retrain_epochs == 0 {
            return Err(PipelineError::invalid_config("number of epochs must be > 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(PipelineError::invalid_config("learning rate must be > 0"));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(PipelineError::invalid_config(
                "validation split must be between 0 and 1",
            ));
        }
        if !(self.retrain_validation_split >= 0.0 && self.retrain_validation_split < 1.0) {
            return Err(PipelineError::invalid_config(
                "retrain validation split must be in [0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(PipelineError::invalid_config("threshold must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Unknown names in `targets` are target errors, not decode errors.
fn check_target_names(raw: &Value) -> Result<()> {
    let Some(targets) = raw.get("targets").and_then(Value::as_array) else {
        return Ok(());
    };
    for name in targets.iter().filter_map(Value::as_str) {
        name.parse::<TargetKind>()?;
    }
    Ok(())
}
