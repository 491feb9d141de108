//! Gradient-sign evasion attacks.
//!
//! Both methods perturb every pixel by a fixed step in the direction of the
//! sign of the loss gradient, project the total perturbation back into the
//! L∞ ball of radius `eps` around the clean image and clip to the valid
//! pixel range. FGSM is the single-step case of PGD.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{AttackBackend, ModelBackend};
use crate::batch::ImageBatch;
use crate::error::{PipelineError, Result};
use crate::metrics::{classify, DEFAULT_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackMethod {
    /// Projected gradient descent.
    Pgd,
    /// Fast gradient sign method.
    Fgsm,
}

impl AttackMethod {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pgd => "pgd",
            Self::Fgsm => "fgsm",
        }
    }
}

impl fmt::Display for AttackMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AttackMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pgd" => Ok(Self::Pgd),
            "fgsm" => Ok(Self::Fgsm),
            other => Err(PipelineError::invalid_config(format!(
                "unknown attack method '{other}', expected 'pgd' or 'fgsm'"
            ))),
        }
    }
}

/// Strength and shape of one attack run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackParams {
    pub method: AttackMethod,
    /// Radius of the L∞ ball around each clean image.
    pub eps: f32,
    /// Per-iteration step.
    pub eps_step: f32,
    pub max_iter: usize,
    /// Move towards the batch labels instead of away from the predictions.
    pub targeted: bool,
    /// Random restarts inside the eps ball; 0 starts from the clean image.
    pub num_random_init: usize,
    pub clip_min: f32,
    pub clip_max: f32,
}

impl AttackParams {
    /// Default parameters of `method`.
    #[must_use]
    pub const fn for_method(method: AttackMethod) -> Self {
        match method {
            AttackMethod::Pgd => Self::pgd(),
            AttackMethod::Fgsm => Self::fgsm(),
        }
    }

    /// eps 8, step 7, 20 iterations, untargeted, no random init.
    #[must_use]
    pub const fn pgd() -> Self {
        Self {
            method: AttackMethod::Pgd,
            eps: 8.0,
            eps_step: 7.0,
            max_iter: 20,
            targeted: false,
            num_random_init: 0,
            clip_min: 0.0,
            clip_max: 1.0,
        }
    }

    /// One untargeted step of 0.1.
    #[must_use]
    pub const fn fgsm() -> Self {
        Self {
            method: AttackMethod::Fgsm,
            eps: 0.1,
            eps_step: 0.1,
            max_iter: 1,
            targeted: false,
            num_random_init: 0,
            clip_min: 0.0,
            clip_max: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.eps.is_nan() || self.eps < 0.0 || self.eps_step.is_nan() || self.eps_step < 0.0 {
            return Err(PipelineError::invalid_config(format!(
                "{}: eps and eps_step must be non-negative",
                self.method
            )));
        }
        if self.max_iter == 0 {
            return Err(PipelineError::invalid_config(format!(
                "{}: max_iter must be at least 1",
                self.method
            )));
        }
        if self.clip_min.is_nan() || self.clip_max.is_nan() || self.clip_min >= self.clip_max {
            return Err(PipelineError::invalid_config(format!(
                "{}: clip range ({}, {}) is empty",
                self.method, self.clip_min, self.clip_max
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AttackParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} eps={} eps_step={} max_iter={} targeted={} random_init={}",
            self.method,
            self.eps,
            self.eps_step,
            self.max_iter,
            self.targeted,
            self.num_random_init
        )
    }
}

/// Sign-gradient attack working through [`ModelBackend::input_gradient`].
///
/// Inputs are crafted in chunks of `batch_size` images. Untargeted attacks
/// use the model's own thresholded predictions as the labels to move away
/// from, so the true labels never leak into the perturbation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradientAttack {
    batch_size: usize,
    seed: u64,
}

impl GradientAttack {
    #[must_use]
    pub const fn new(batch_size: usize, seed: u64) -> Self {
        Self { batch_size, seed }
    }

    fn craft_chunk<M: ModelBackend>(
        &self,
        backend: &M,
        model: &M::Model,
        clean: &ImageBatch,
        params: &AttackParams,
        rng: &mut StdRng,
    ) -> Result<ImageBatch> {
        let targets: Vec<f32> = if params.targeted {
            clean.labels().to_vec()
        } else {
            backend
                .predict(model, clean)?
                .iter()
                .map(|&p| f32::from(classify(p, DEFAULT_THRESHOLD)))
                .collect()
        };

        if params.num_random_init == 0 {
            let pixels = iterate(backend, model, clean, clean.pixels().to_vec(), &targets, params)?;
            return clean.with_pixels(pixels);
        }

        // Restarts: keep, per image, the first candidate that fools the model.
        let frame = clean.frame_size();
        let mut best = clean.pixels().to_vec();
        let mut fooled = vec![false; clean.len()];
        for restart in 0..params.num_random_init {
            let start: Vec<f32> = clean
                .pixels()
                .iter()
                .map(|&x| {
                    let offset = if params.eps > 0.0 {
                        rng.gen_range(-params.eps..=params.eps)
                    } else {
                        0.0
                    };
                    (x + offset).clamp(params.clip_min, params.clip_max)
                })
                .collect();
            let candidate = clean.with_pixels(iterate(backend, model, clean, start, &targets, params)?)?;
            let predictions = backend.predict(model, &candidate)?;

            for (i, &p) in predictions.iter().enumerate() {
                if fooled[i] {
                    continue;
                }
                let label = f32::from(classify(p, DEFAULT_THRESHOLD));
                let success = if params.targeted {
                    label == targets[i]
                } else {
                    label != targets[i]
                };
                if success || restart + 1 == params.num_random_init {
                    best[i * frame..(i + 1) * frame].copy_from_slice(candidate.image(i));
                    fooled[i] = success;
                }
            }
        }
        clean.with_pixels(best)
    }
}

impl<M: ModelBackend> AttackBackend<M> for GradientAttack {
    fn craft(
        &self,
        backend: &M,
        model: &M::Model,
        inputs: &ImageBatch,
        params: &AttackParams,
    ) -> Result<ImageBatch> {
        params.validate()?;
        info!(method = %params.method, images = inputs.len(), params = %params, "crafting adversarial inputs");

        let mut rng = StdRng::seed_from_u64(self.seed);
        let chunk = self.batch_size.max(1);
        let mut adversarial = ImageBatch::empty(inputs.side());
        for start in (0..inputs.len()).step_by(chunk) {
            let clean = inputs.slice(start..start + chunk);
            let crafted = self.craft_chunk(backend, model, &clean, params, &mut rng)?;
            adversarial.extend(&crafted)?;
            debug!(done = adversarial.len(), total = inputs.len(), "crafted chunk");
        }
        Ok(adversarial)
    }
}

fn iterate<M: ModelBackend>(
    backend: &M,
    model: &M::Model,
    clean: &ImageBatch,
    start: Vec<f32>,
    targets: &[f32],
    params: &AttackParams,
) -> Result<Vec<f32>> {
    let direction = if params.targeted { -1.0 } else { 1.0 };
    let mut pixels = start;
    for _ in 0..params.max_iter {
        let current = clean.with_pixels(pixels)?;
        let gradient = backend.input_gradient(model, &current, targets)?;
        if gradient.len() != current.pixels().len() {
            return Err(PipelineError::shape_mismatch(
                format!("{} gradient values", current.pixels().len()),
                format!("{} gradient values", gradient.len()),
            ));
        }
        pixels = current
            .pixels()
            .iter()
            .zip(&gradient)
            .zip(clean.pixels())
            .map(|((&x, &g), &x0)| {
                let moved = x + direction * params.eps_step * sign(g);
                moved
                    .clamp(x0 - params.eps, x0 + params.eps)
                    .clamp(params.clip_min, params.clip_max)
            })
            .collect();
    }
    Ok(pixels)
}

fn sign(g: f32) -> f32 {
    if g > 0.0 {
        1.0
    } else if g < 0.0 {
        -1.0
    } else {
        0.0
    }
}
