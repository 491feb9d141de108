//! Filesystem store for model artifacts and run outputs.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::info;

use crate::backend::TrainingHistory;
use crate::error::{PipelineError, Result};
use crate::model::SleepNetConfig;
use crate::report::PredictionTable;
use crate::target::TargetKind;

/// Extension of the architecture descriptor.
pub const DESCRIPTOR_EXTENSION: &str = "json";

/// Extension appended by the weight recorder.
pub const WEIGHTS_EXTENSION: &str = "mpk";

/// Directory holding `model-<target>.json`, `model-<target>.mpk`,
/// `results-<target>.csv` and `history-<target>.json`.
///
/// Writes replace whole files; the last writer for a target wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| PipelineError::io(&self.dir, e))
    }

    pub fn descriptor_path(&self, target: TargetKind) -> PathBuf {
        self.weights_stem(target)
            .with_extension(DESCRIPTOR_EXTENSION)
    }

    /// Weight path without extension, as handed to the recorder.
    pub fn weights_stem(&self, target: TargetKind) -> PathBuf {
        self.dir.join(target.model_stem())
    }

    pub fn weights_path(&self, target: TargetKind) -> PathBuf {
        self.weights_stem(target).with_extension(WEIGHTS_EXTENSION)
    }

    pub fn results_path(&self, target: TargetKind) -> PathBuf {
        self.dir.join(target.results_file())
    }

    pub fn history_path(&self, target: TargetKind) -> PathBuf {
        self.dir.join(target.history_file())
    }

    /// Fails with `ArtifactNotFound` unless both model files exist.
    pub fn require_model(&self, target: TargetKind) -> Result<()> {
        for path in [self.descriptor_path(target), self.weights_path(target)] {
            if !path.is_file() {
                return Err(PipelineError::artifact_not_found(target.name(), path));
            }
        }
        Ok(())
    }

    pub fn has_model(&self, target: TargetKind) -> bool {
        self.require_model(target).is_ok()
    }

    pub fn write_descriptor(&self, target: TargetKind, config: &SleepNetConfig) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.descriptor_path(target);
        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        serde_json::to_writer_pretty(file, config)?;
        Ok(path)
    }

    pub fn read_descriptor(&self, target: TargetKind) -> Result<SleepNetConfig> {
        let path = self.descriptor_path(target);
        if !path.is_file() {
            return Err(PipelineError::artifact_not_found(target.name(), path));
        }
        let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
        let config: SleepNetConfig = serde_json::from_str(&text)?;
        config.validate()?;
        if config.image_size != target.image_size() {
            return Err(PipelineError::shape_mismatch(
                format!("image size {}", target.image_size()),
                format!("image size {}", config.image_size),
            ));
        }
        Ok(config)
    }

    /// Writes the two-column `Filename,Predictions` table.
    pub fn write_predictions(&self, target: TargetKind, table: &PredictionTable) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.results_path(target);
        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "Filename,Predictions").map_err(|e| PipelineError::io(&path, e))?;
        for row in &table.rows {
            writeln!(
                writer,
                "{},{}",
                escape_csv(&row.filename),
                escape_csv(&row.label)
            )
            .map_err(|e| PipelineError::io(&path, e))?;
        }
        writer.flush().map_err(|e| PipelineError::io(&path, e))?;

        info!(target = %target, rows = table.rows.len(), path = %path.display(), "wrote predictions");
        Ok(path)
    }

    pub fn write_history(&self, target: TargetKind, history: &TrainingHistory) -> Result<PathBuf> {
        self.ensure_dir()?;
        let path = self.history_path(target);
        let file = File::create(&path).map_err(|e| PipelineError::io(&path, e))?;
        serde_json::to_writer_pretty(file, history)?;
        Ok(path)
    }
}

/// Quotes a CSV field when it holds a comma, quote or newline.
pub fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
