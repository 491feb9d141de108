//! Random affine augmentation of square grayscale images.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AugmentationConfig;

/// One sampled transform, mapping output coordinates back to input ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub theta: f32,
    pub shift_rows: f32,
    pub shift_cols: f32,
    pub shear: f32,
    pub zoom_rows: f32,
    pub zoom_cols: f32,
    pub flip: bool,
}

impl AffineParams {
    pub const IDENTITY: Self = Self {
        theta: 0.0,
        shift_rows: 0.0,
        shift_cols: 0.0,
        shear: 0.0,
        zoom_rows: 1.0,
        zoom_cols: 1.0,
        flip: false,
    };

    /// Applies the transform with nearest-neighbour sampling and edge fill.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn apply(&self, pixels: &[f32], side: usize) -> Vec<f32> {
        if *self == Self::IDENTITY || side == 0 {
            return pixels.to_vec();
        }
        let center = (side as f32 - 1.0) / 2.0;
        let max = (side - 1) as f32;
        let (sin_t, cos_t) = self.theta.sin_cos();
        let (sin_s, cos_s) = self.shear.sin_cos();

        let mut out = vec![0.0; side * side];
        for row in 0..side {
            for col in 0..side {
                // zoom, shear, shift, rotate, all about the image centre
                let y = (row as f32 - center) * self.zoom_rows;
                let x = (col as f32 - center) * self.zoom_cols;
                let (y, x) = (y - sin_s * x, cos_s * x);
                let (y, x) = (y + self.shift_rows, x + self.shift_cols);
                let (y, x) = (cos_t * y - sin_t * x, sin_t * y + cos_t * x);

                let src_row = (y + center).round().clamp(0.0, max) as usize;
                let src_col = (x + center).round().clamp(0.0, max) as usize;
                let dst_col = if self.flip { side - 1 - col } else { col };
                out[row * side + dst_col] = pixels[src_row * side + src_col];
            }
        }
        out
    }
}

/// Draws one random transform per image from the configured ranges.
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
    rng: StdRng,
}

impl Augmenter {
    #[must_use]
    pub fn new(config: AugmentationConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, side: usize) -> AffineParams {
        let c = self.config;
        let side = side as f32;
        let theta = symmetric(&mut self.rng, c.rotation_range).to_radians();
        let shift_rows = symmetric(&mut self.rng, c.height_shift_range) * side;
        let shift_cols = symmetric(&mut self.rng, c.width_shift_range) * side;
        let shear = symmetric(&mut self.rng, c.shear_range);
        let (zoom_rows, zoom_cols) = if c.zoom_range > 0.0 {
            let lo = 1.0 - c.zoom_range;
            let hi = 1.0 + c.zoom_range;
            (self.rng.gen_range(lo..=hi), self.rng.gen_range(lo..=hi))
        } else {
            (1.0, 1.0)
        };
        let flip = c.horizontal_flip && self.rng.gen_bool(0.5);
        AffineParams {
            theta,
            shift_rows,
            shift_cols,
            shear,
            zoom_rows,
            zoom_cols,
            flip,
        }
    }

    /// Augments one image in place.
    pub fn augment(&mut self, pixels: &mut Vec<f32>, side: usize) {
        if self.config.is_identity() {
            return;
        }
        let params = self.sample(side);
        *pixels = params.apply(pixels, side);
    }
}

fn symmetric(rng: &mut StdRng, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}
