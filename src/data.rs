use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::{
    imageops::{self, FilterType},
    GrayImage, ImageReader, Luma, RgbImage,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::augment::Augmenter;
use crate::batch::{BatchSource, ImageBatch, InMemorySource};
use crate::config::{AugmentationConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::target::{SplitKind, TargetKind};

const VALID_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// Stable mapping between class names and numeric labels.
///
/// Labels follow the alphabetical order of the class directories, so the
/// eye dataset maps `closed` to 0 and `open` to 1.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassIndices {
    names: Vec<String>,
}

impl ClassIndices {
    /// Sorts and deduplicates the given class names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.names.iter().position(|n| n == name).map(|i| i as u8)
    }

    pub fn name_of(&self, label: u8) -> Option<&str> {
        self.names.get(label as usize).map(String::as_str)
    }
}

/// One image file and its class label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderItem {
    pub path: PathBuf,
    /// Path relative to the split root, e.g. `open/img_001.png`.
    pub filename: String,
    pub class: u8,
}

/// A named dataset partition with its label table.
pub trait DatasetSplit: BatchSource {
    fn kind(&self) -> SplitKind;

    fn class_indices(&self) -> &ClassIndices;

    /// Relative file names in iteration order.
    fn filenames(&self) -> &[String];

    /// Ground-truth labels in iteration order.
    fn classes(&self) -> Vec<u8>;
}

/// Split backed by a directory of class subfolders.
#[derive(Debug)]
pub struct ImageFolderSplit {
    kind: SplitKind,
    items: Vec<FolderItem>,
    filenames: Vec<String>,
    class_indices: ClassIndices,
    image_size: usize,
    batch_size: usize,
    augmenter: Option<Mutex<Augmenter>>,
}

impl ImageFolderSplit {
    pub fn new(
        kind: SplitKind,
        items: Vec<FolderItem>,
        class_indices: ClassIndices,
        image_size: usize,
        batch_size: usize,
    ) -> Self {
        let filenames = items.iter().map(|i| i.filename.clone()).collect();
        Self {
            kind,
            items,
            filenames,
            class_indices,
            image_size,
            batch_size,
            augmenter: None,
        }
    }

    /// Enables random augmentation; identity ranges leave the split untouched.
    pub fn with_augmentation(mut self, config: AugmentationConfig, seed: u64) -> Self {
        self.augmenter = if config.is_identity() {
            None
        } else {
            Some(Mutex::new(Augmenter::new(config, seed)))
        };
        self
    }
}

impl BatchSource for ImageFolderSplit {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn image_size(&self) -> usize {
        self.image_size
    }

    fn batch(&self, index: usize) -> Result<ImageBatch> {
        let count = self.batch_count();
        if index >= count {
            return Err(PipelineError::BatchOutOfRange { index, count });
        }
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.items.len());
        let items = &self.items[start..end];

        let mut images: Vec<Vec<f32>> = items
            .par_iter()
            .map(|item| load_grayscale(&item.path, self.image_size))
            .collect::<Result<_>>()?;

        if let Some(augmenter) = &self.augmenter {
            let mut augmenter = augmenter
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for image in &mut images {
                augmenter.augment(image, self.image_size);
            }
        }

        let pixels = images.into_iter().flatten().collect();
        let labels = items.iter().map(|i| f32::from(i.class)).collect();
        ImageBatch::new(self.image_size, pixels, labels)
    }
}

impl DatasetSplit for ImageFolderSplit {
    fn kind(&self) -> SplitKind {
        self.kind
    }

    fn class_indices(&self) -> &ClassIndices {
        &self.class_indices
    }

    fn filenames(&self) -> &[String] {
        &self.filenames
    }

    fn classes(&self) -> Vec<u8> {
        self.items.iter().map(|i| i.class).collect()
    }
}

/// The three splits of one target's dataset.
#[derive(Debug)]
pub struct Splits {
    pub train: ImageFolderSplit,
    pub validation: ImageFolderSplit,
    pub test: ImageFolderSplit,
}

impl Splits {
    pub const fn get(&self, kind: SplitKind) -> &ImageFolderSplit {
        match kind {
            SplitKind::Train => &self.train,
            SplitKind::Validation => &self.validation,
            SplitKind::Test => &self.test,
        }
    }
}

/// Split over arrays already held in memory, one file name per image.
#[derive(Debug, Clone)]
pub struct MemorySplit {
    kind: SplitKind,
    source: InMemorySource,
    filenames: Vec<String>,
    class_indices: ClassIndices,
}

impl MemorySplit {
    pub fn new(
        kind: SplitKind,
        data: ImageBatch,
        batch_size: usize,
        filenames: Vec<String>,
        class_indices: ClassIndices,
    ) -> Result<Self> {
        if filenames.len() != data.len() {
            return Err(PipelineError::shape_mismatch(
                format!("{} file names", data.len()),
                format!("{} file names", filenames.len()),
            ));
        }
        Ok(Self {
            kind,
            source: InMemorySource::new(data, batch_size),
            filenames,
            class_indices,
        })
    }
}

impl BatchSource for MemorySplit {
    fn len(&self) -> usize {
        self.source.len()
    }

    fn batch_size(&self) -> usize {
        self.source.batch_size()
    }

    fn image_size(&self) -> usize {
        self.source.image_size()
    }

    fn batch(&self, index: usize) -> Result<ImageBatch> {
        self.source.batch(index)
    }
}

impl DatasetSplit for MemorySplit {
    fn kind(&self) -> SplitKind {
        self.kind
    }

    fn class_indices(&self) -> &ClassIndices {
        &self.class_indices
    }

    fn filenames(&self) -> &[String] {
        &self.filenames
    }

    fn classes(&self) -> Vec<u8> {
        self.source
            .data()
            .labels()
            .iter()
            .map(|&l| u8::from(l >= 0.5))
            .collect()
    }
}

/// Builds splits from `<root>/train-<target>` and `<root>/test-<target>`.
#[derive(Debug, Clone)]
pub struct DatasetProvider {
    root: PathBuf,
    batch_size: usize,
    test_batch_size: usize,
    validation_split: f64,
    seed: u64,
    augmentation: AugmentationConfig,
}

impl DatasetProvider {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            root: config.dataset_root.clone(),
            batch_size: config.batch_size,
            test_batch_size: config.test_batch_size,
            validation_split: config.validation_split,
            seed: config.seed,
            augmentation: config.augmentation(),
        }
    }

    /// Overrides the augmentation table.
    pub const fn with_augmentation(mut self, augmentation: AugmentationConfig) -> Self {
        self.augmentation = augmentation;
        self
    }

    /// Collects train, validation and test splits for `target`.
    ///
    /// Within each class the first `floor(validation_split * n)` files (in
    /// name order) go to validation and the rest to training; both are then
    /// shuffled with the configured seed. The test split keeps name order.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn collect(&self, target: TargetKind) -> Result<Splits> {
        let side = target.image_size();
        let train_dir = self.root.join(target.train_dir());
        let test_dir = self.root.join(target.test_dir());

        info!(target = %target, dir = %train_dir.display(), "loading images");
        let (class_indices, per_class) = scan_class_folders(&train_dir)?;

        let mut train_items = Vec::new();
        let mut valid_items = Vec::new();
        for items in per_class {
            let n_valid = (items.len() as f64 * self.validation_split) as usize;
            let (valid, train) = items.split_at(n_valid);
            valid_items.extend_from_slice(valid);
            train_items.extend_from_slice(train);
        }
        train_items.shuffle(&mut StdRng::seed_from_u64(self.seed));
        valid_items.shuffle(&mut StdRng::seed_from_u64(self.seed));

        let (test_indices, test_per_class) = scan_class_folders(&test_dir)?;
        if test_indices != class_indices {
            debug!(
                train = ?class_indices.names(),
                test = ?test_indices.names(),
                "test classes differ from training classes"
            );
        }
        let test_items: Vec<FolderItem> = test_per_class.into_iter().flatten().collect();

        log_statistics(SplitKind::Train, &train_items, &class_indices);
        log_statistics(SplitKind::Validation, &valid_items, &class_indices);
        log_statistics(SplitKind::Test, &test_items, &test_indices);

        let train = ImageFolderSplit::new(
            SplitKind::Train,
            train_items,
            class_indices.clone(),
            side,
            self.batch_size,
        )
        .with_augmentation(self.augmentation, self.seed);
        let validation = ImageFolderSplit::new(
            SplitKind::Validation,
            valid_items,
            class_indices,
            side,
            self.batch_size,
        )
        .with_augmentation(self.augmentation, self.seed.wrapping_add(1));
        let test = ImageFolderSplit::new(
            SplitKind::Test,
            test_items,
            test_indices,
            side,
            self.test_batch_size,
        );

        Ok(Splits {
            train,
            validation,
            test,
        })
    }
}

/// Scans `dir/<class>/**` and returns the class table plus items per class,
/// each class sorted by file name.
pub fn scan_class_folders(dir: &Path) -> Result<(ClassIndices, Vec<Vec<FolderItem>>)> {
    if !dir.is_dir() {
        return Err(PipelineError::MissingDirectory(dir.to_path_buf()));
    }

    let mut class_dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            class_dirs.push(path);
        }
    }
    class_dirs.sort();

    let class_indices = ClassIndices::new(
        class_dirs
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned()),
    );

    let mut per_class = Vec::with_capacity(class_dirs.len());
    let mut total = 0;
    for (class, class_dir) in class_dirs.iter().enumerate() {
        let mut files = collect_image_files(class_dir)?;
        files.sort();
        total += files.len();
        #[allow(clippy::cast_possible_truncation)]
        let items = files
            .into_iter()
            .map(|path| FolderItem {
                filename: relative_name(dir, &path),
                path,
                class: class as u8,
            })
            .collect();
        per_class.push(items);
    }

    if total == 0 {
        return Err(PipelineError::MissingDirectory(dir.to_path_buf()));
    }
    Ok((class_indices, per_class))
}

fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![dir.to_path_buf()];

    while let Some(current_dir) = dirs.pop() {
        let entries = fs::read_dir(&current_dir).map_err(|e| PipelineError::io(&current_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| PipelineError::io(&current_dir, e))?.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.is_file() && has_image_extension(&path) {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| VALID_EXTENSIONS.contains(&ext.as_str()))
}

fn relative_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn log_statistics(kind: SplitKind, items: &[FolderItem], classes: &ClassIndices) {
    let mut counts = vec![0usize; classes.len()];
    for item in items {
        if let Some(c) = counts.get_mut(item.class as usize) {
            *c += 1;
        }
    }
    info!(
        split = %kind,
        images = items.len(),
        classes = classes.len(),
        per_class = ?classes.names().iter().zip(&counts).collect::<Vec<_>>(),
        "found images"
    );
}

/// Decodes an image, converts it to grayscale, resizes it to `side` x `side`
/// and rescales intensities by 1/255.
pub fn load_grayscale(path: &Path, side: usize) -> Result<Vec<f32>> {
    let side_u32 = u32::try_from(side)
        .map_err(|_| PipelineError::shape_mismatch("side fitting in u32", side.to_string()))?;
    let img = ImageReader::open(path)
        .map_err(|e| PipelineError::io(path, e))?
        .decode()
        .map_err(|e| PipelineError::Image {
            path: path.to_path_buf(),
            source: e,
        })?;

    let gray = imageops::resize(&to_gray(&img.to_rgb8()), side_u32, side_u32, FilterType::Nearest);
    Ok(gray
        .into_raw()
        .into_iter()
        .map(|p| f32::from(p) / 255.0)
        .collect())
}

/// ITU-R 601-2 luma (299/587/114) in 16-bit fixed point, rounded.
///
/// `image`'s own `to_luma8` uses Rec. 709 weights, which shifts colour
/// inputs away from what the datasets were prepared with.
fn to_gray(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = u32::from(r) * 19_595 + u32::from(g) * 38_470 + u32::from(b) * 7_471 + 0x8000;
        #[allow(clippy::cast_possible_truncation)]
        Luma([(l >> 16) as u8])
    })
}

/// Drains a split into one in-memory batch.
///
/// Reads batches from the start until as many images as the split has file
/// names have been collected, then stops; the drain is bounded even when a
/// split would keep yielding.
pub fn materialize<S: DatasetSplit + ?Sized>(split: &S) -> Result<ImageBatch> {
    let wanted = split.filenames().len();
    let mut out = ImageBatch::empty(split.image_size());
    let mut index = 0;
    while out.len() < wanted && index < split.batch_count() {
        let batch = split.batch(index)?;
        out.extend(&batch.slice(0..wanted - out.len()))?;
        index += 1;
    }
    info!(split = %split.kind(), images = out.len(), "materialized split");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(path: &Path, side: u32, value: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(side, side, Luma([value])).save(path).unwrap();
    }

    fn eye_dataset(root: &Path, per_class: usize) {
        for class in ["open", "closed"] {
            let value = if class == "open" { 255 } else { 0 };
            for i in 0..per_class {
                write_image(&root.join(format!("train-eye/{class}/{i:03}.png")), 30, value);
            }
            for i in 0..2 {
                write_image(&root.join(format!("test-eye/{class}/{i:03}.png")), 30, value);
            }
        }
    }

    fn provider(root: &Path) -> DatasetProvider {
        DatasetProvider::new(&PipelineConfig {
            dataset_root: root.to_path_buf(),
            ..PipelineConfig::default()
        })
    }

    #[test]
    fn class_indices_are_alphabetical() {
        let classes = ClassIndices::new(["open", "closed"]);
        assert_eq!(classes.index_of("closed"), Some(0));
        assert_eq!(classes.index_of("open"), Some(1));
        assert_eq!(classes.name_of(1), Some("open"));
        assert_eq!(classes.name_of(2), None);
    }

    #[test]
    fn eighty_twenty_partition_per_class() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 40);

        let splits = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        assert_eq!(splits.train.len(), 64);
        assert_eq!(splits.validation.len(), 16);
        assert_eq!(splits.train.steps(), 2);
        assert_eq!(splits.validation.steps(), 0);
        assert_eq!(splits.test.len(), 4);
        assert_eq!(splits.test.batch_size(), 1);

        let train_classes = splits.train.classes();
        assert_eq!(train_classes.iter().filter(|&&c| c == 1).count(), 32);
    }

    #[test]
    fn partition_is_reproducible_for_a_seed() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 10);

        let a = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        let b = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        assert_eq!(a.train.filenames(), b.train.filenames());
        assert_eq!(a.validation.filenames(), b.validation.filenames());
    }

    #[test]
    fn test_split_keeps_name_order() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 5);

        let splits = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        assert_eq!(
            splits.test.filenames(),
            &[
                "closed/000.png".to_string(),
                "closed/001.png".to_string(),
                "open/000.png".to_string(),
                "open/001.png".to_string(),
            ]
        );
        assert_eq!(splits.test.classes(), vec![0, 0, 1, 1]);
    }

    #[test]
    fn batches_are_resized_and_rescaled() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 5);

        let splits = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        let batch = splits.test.batch(3).unwrap();
        assert_eq!(batch.side(), 24);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.labels(), &[1.0]);
        assert!(batch.pixels().iter().all(|&p| (p - 1.0).abs() < 1e-6));
    }

    #[test]
    fn colour_images_use_601_luma() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0])).save(&path).unwrap();

        let pixels = load_grayscale(&path, 2).unwrap();
        assert_eq!(pixels.len(), 4);
        assert!(pixels.iter().all(|&p| (p - 76.0 / 255.0).abs() < 1e-6));
    }

    #[test]
    fn augmentation_changes_train_pixels_only() {
        let dir = tempfile::tempdir().unwrap();
        for (class, split) in [("open", "train-eye"), ("closed", "train-eye"), ("open", "test-eye")] {
            for i in 0..8u8 {
                let path = dir.path().join(format!("{split}/{class}/{i:03}.png"));
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                GrayImage::from_fn(24, 24, |x, y| Luma([(x * 10 + y + u32::from(i)) as u8]))
                    .save(&path)
                    .unwrap();
            }
        }

        let plain = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        let augmented = provider(dir.path())
            .with_augmentation(AugmentationConfig::standard())
            .collect(TargetKind::Eye)
            .unwrap();

        let before = plain.train.batch(0).unwrap();
        let after = augmented.train.batch(0).unwrap();
        assert_eq!(before.labels(), after.labels());
        assert_ne!(before.pixels(), after.pixels());
        assert_eq!(
            plain.test.batch(0).unwrap(),
            augmented.test.batch(0).unwrap()
        );
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = provider(dir.path()).collect(TargetKind::Face);
        assert!(matches!(err, Err(PipelineError::MissingDirectory(_))));
    }

    #[test]
    fn empty_class_folders_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("train-eye/open")).unwrap();
        let err = scan_class_folders(&dir.path().join("train-eye"));
        assert!(matches!(err, Err(PipelineError::MissingDirectory(_))));
    }

    #[test]
    fn materialize_collects_every_item_once() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 10);

        let splits = provider(dir.path()).collect(TargetKind::Eye).unwrap();
        let all = materialize(&splits.train).unwrap();
        assert_eq!(all.len(), splits.train.filenames().len());
        let labels: Vec<u8> = all.labels().iter().map(|&l| l as u8).collect();
        assert_eq!(labels, splits.train.classes());
    }

    #[test]
    fn memory_split_needs_one_name_per_image() {
        let data = ImageBatch::new(2, vec![0.0; 12], vec![0.0, 1.0, 1.0]).unwrap();
        let names = vec!["a".to_string(), "b".to_string()];
        let indices = ClassIndices::new(["closed", "open"]);
        assert!(matches!(
            MemorySplit::new(SplitKind::Test, data.clone(), 1, names, indices.clone()),
            Err(PipelineError::ShapeMismatch { .. })
        ));

        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let split = MemorySplit::new(SplitKind::Test, data, 2, names, indices).unwrap();
        assert_eq!(split.classes(), vec![0, 1, 1]);
        assert_eq!(split.steps(), 1);
        assert_eq!(split.batch_count(), 2);
        assert_eq!(materialize(&split).unwrap().len(), 3);
    }

    #[test]
    fn non_image_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        eye_dataset(dir.path(), 3);
        fs::write(dir.path().join("train-eye/open/notes.txt"), "x").unwrap();

        let (_, per_class) = scan_class_folders(&dir.path().join("train-eye")).unwrap();
        assert_eq!(per_class[1].len(), 3);
    }
}
