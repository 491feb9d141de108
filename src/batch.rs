//! In-memory image batches and the batch source contract.
//!
//! Pixels are grayscale, row-major, one channel, rescaled to `[0, 1]`:
//! image `i` occupies `pixels[i * side * side..(i + 1) * side * side]`.

use std::ops::Range;

use rand::{seq::SliceRandom, Rng};

use crate::error::{PipelineError, Result};

/// Shape string for `n` square grayscale images.
pub fn shape_string(n: usize, side: usize) -> String {
    format!("[{n}, {side}, {side}, 1]")
}

/// Images of one side length paired with binary labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    side: usize,
    pixels: Vec<f32>,
    labels: Vec<f32>,
}

impl ImageBatch {
    /// Builds a batch, checking that pixels cover exactly one image per label.
    pub fn new(side: usize, pixels: Vec<f32>, labels: Vec<f32>) -> Result<Self> {
        let frame = side * side;
        if frame == 0 || pixels.len() != labels.len() * frame {
            return Err(PipelineError::shape_mismatch(
                shape_string(labels.len(), side),
                format!("{} pixels", pixels.len()),
            ));
        }
        Ok(Self {
            side,
            pixels,
            labels,
        })
    }

    pub const fn empty(side: usize) -> Self {
        Self {
            side,
            pixels: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub const fn side(&self) -> usize {
        self.side
    }

    pub const fn frame_size(&self) -> usize {
        self.side * self.side
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Pixels of image `index`.
    pub fn image(&self, index: usize) -> &[f32] {
        let frame = self.frame_size();
        &self.pixels[index * frame..(index + 1) * frame]
    }

    /// Replaces the inputs and keeps the labels, as attacks do.
    pub fn with_pixels(&self, pixels: Vec<f32>) -> Result<Self> {
        Self::new(self.side, pixels, self.labels.clone())
    }

    /// Fails with `ShapeMismatch` unless images are `side` x `side`.
    pub fn ensure_side(&self, side: usize) -> Result<()> {
        if self.side == side {
            Ok(())
        } else {
            Err(PipelineError::shape_mismatch(
                shape_string(self.len(), side),
                shape_string(self.len(), self.side),
            ))
        }
    }

    /// Appends another batch of the same side.
    pub fn extend(&mut self, other: &Self) -> Result<()> {
        other.ensure_side(self.side)?;
        self.pixels.extend_from_slice(&other.pixels);
        self.labels.extend_from_slice(&other.labels);
        Ok(())
    }

    /// Copies images `range` into a new batch. The range is clamped to the batch.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        let frame = self.frame_size();
        Self {
            side: self.side,
            pixels: self.pixels[start * frame..end * frame].to_vec(),
            labels: self.labels[start..end].to_vec(),
        }
    }

    /// Splits off the trailing `fraction` of images, keeping order.
    ///
    /// The tail holds `floor(len * fraction)` images.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn split_tail(&self, fraction: f64) -> (Self, Self) {
        let tail = (self.len() as f64 * fraction).floor() as usize;
        let at = self.len() - tail.min(self.len());
        (self.slice(0..at), self.slice(at..self.len()))
    }

    /// Copies the images in a random order, each keeping its label.
    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        let mut pixels = Vec::with_capacity(self.pixels.len());
        let mut labels = Vec::with_capacity(self.labels.len());
        for &i in &order {
            pixels.extend_from_slice(self.image(i));
            labels.push(self.labels[i]);
        }
        Self {
            side: self.side,
            pixels,
            labels,
        }
    }
}

/// Reads every batch of `source`, the trailing partial one included.
pub fn collect_source(source: &dyn BatchSource) -> Result<ImageBatch> {
    let mut out = ImageBatch::empty(source.image_size());
    for index in 0..source.batch_count() {
        out.extend(&source.batch(index)?)?;
    }
    Ok(out)
}

/// A finite, restartable sequence of fixed-size batches.
pub trait BatchSource {
    /// Total number of images.
    fn len(&self) -> usize;

    /// Images per batch; the last batch may be shorter.
    fn batch_size(&self) -> usize;

    /// Side length of every image.
    fn image_size(&self) -> usize;

    /// Loads batch `index`, `0 <= index < batch_count()`.
    fn batch(&self, index: usize) -> Result<ImageBatch>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full batches only: `floor(len / batch_size)`.
    fn steps(&self) -> usize {
        if self.batch_size() == 0 {
            0
        } else {
            self.len() / self.batch_size()
        }
    }

    /// All batches including a trailing partial one.
    fn batch_count(&self) -> usize {
        if self.batch_size() == 0 {
            0
        } else {
            self.len().div_ceil(self.batch_size())
        }
    }

    /// Iterates every batch from the start.
    fn batches(&self) -> Batches<'_, Self>
    where
        Self: Sized,
    {
        Batches {
            source: self,
            next: 0,
            end: self.batch_count(),
        }
    }
}

/// Iterator returned by [`BatchSource::batches`].
#[derive(Debug)]
pub struct Batches<'a, S: ?Sized> {
    source: &'a S,
    next: usize,
    end: usize,
}

impl<S: BatchSource + ?Sized> Iterator for Batches<'_, S> {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.source.batch(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end - self.next;
        (left, Some(left))
    }
}

/// Batches cut from arrays already held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    data: ImageBatch,
    batch_size: usize,
}

impl InMemorySource {
    pub const fn new(data: ImageBatch, batch_size: usize) -> Self {
        Self { data, batch_size }
    }

    pub const fn data(&self) -> &ImageBatch {
        &self.data
    }
}

impl BatchSource for InMemorySource {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn image_size(&self) -> usize {
        self.data.side()
    }

    fn batch(&self, index: usize) -> Result<ImageBatch> {
        let count = self.batch_count();
        if index >= count {
            return Err(PipelineError::BatchOutOfRange { index, count });
        }
        let start = index * self.batch_size;
        Ok(self.data.slice(start..start + self.batch_size))
    }
}
