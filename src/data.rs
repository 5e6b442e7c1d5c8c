use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::{Int, Shape, Tensor, TensorData},
};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::ExperimentConfig,
    error::{OdirError, Result},
};

pub const NUM_CLASSES: usize = 8;

/// The eight ODIR diagnostic classes, in label-column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiseaseClass {
    Normal,
    Diabetes,
    Glaucoma,
    Cataract,
    Amd,
    Hypertension,
    Myopia,
    Others,
}

impl DiseaseClass {
    pub const ALL: [DiseaseClass; NUM_CLASSES] = [
        DiseaseClass::Normal,
        DiseaseClass::Diabetes,
        DiseaseClass::Glaucoma,
        DiseaseClass::Cataract,
        DiseaseClass::Amd,
        DiseaseClass::Hypertension,
        DiseaseClass::Myopia,
        DiseaseClass::Others,
    ];

    pub fn to_index(&self) -> usize {
        match self {
            DiseaseClass::Normal => 0,
            DiseaseClass::Diabetes => 1,
            DiseaseClass::Glaucoma => 2,
            DiseaseClass::Cataract => 3,
            DiseaseClass::Amd => 4,
            DiseaseClass::Hypertension => 5,
            DiseaseClass::Myopia => 6,
            DiseaseClass::Others => 7,
        }
    }

    /// Column code used in the ODIR label and submission files.
    pub fn code(&self) -> &'static str {
        match self {
            DiseaseClass::Normal => "N",
            DiseaseClass::Diabetes => "D",
            DiseaseClass::Glaucoma => "G",
            DiseaseClass::Cataract => "C",
            DiseaseClass::Amd => "A",
            DiseaseClass::Hypertension => "H",
            DiseaseClass::Myopia => "M",
            DiseaseClass::Others => "O",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiseaseClass::Normal => "Normal",
            DiseaseClass::Diabetes => "Diabetes",
            DiseaseClass::Glaucoma => "Glaucoma",
            DiseaseClass::Cataract => "Cataract",
            DiseaseClass::Amd => "AMD",
            DiseaseClass::Hypertension => "Hypertension",
            DiseaseClass::Myopia => "Myopia",
            DiseaseClass::Others => "Others",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|c| c.name()).collect()
    }
}

/// Input normalisation expected by the backbone weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preprocessing {
    /// BGR order, ImageNet mean subtracted, no scaling (Keras/Caffe weights).
    Caffe,
    /// RGB in [0, 1], standardised per channel (torchvision weights).
    Torch,
}

const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl Preprocessing {
    /// Turn interleaved RGB bytes (HWC) into a channel-first float buffer.
    pub fn apply(&self, pixels: &[u8], height: usize, width: usize) -> Vec<f32> {
        let plane = height * width;
        let mut out = vec![0.0f32; 3 * plane];

        for (i, rgb) in pixels.chunks_exact(3).take(plane).enumerate() {
            match self {
                Preprocessing::Caffe => {
                    out[i] = rgb[2] as f32 - CAFFE_MEAN_BGR[0];
                    out[plane + i] = rgb[1] as f32 - CAFFE_MEAN_BGR[1];
                    out[2 * plane + i] = rgb[0] as f32 - CAFFE_MEAN_BGR[2];
                }
                Preprocessing::Torch => {
                    for c in 0..3 {
                        out[c * plane + i] = (rgb[c] as f32 / 255.0 - TORCH_MEAN[c]) / TORCH_STD[c];
                    }
                }
            }
        }

        out
    }
}

/// One fundus image, resized and kept as raw RGB so it can still be drawn.
#[derive(Debug, Clone)]
pub struct OdirSample {
    pub id: String,
    pub pixels: Vec<u8>,
    pub labels: [u8; NUM_CLASSES],
    pub height: usize,
    pub width: usize,
}

impl OdirSample {
    pub fn from_image(id: String, img: &DynamicImage, labels: [u8; NUM_CLASSES], size: usize) -> Self {
        let img = img.resize_exact(size as u32, size as u32, FilterType::Lanczos3);
        let pixels = img.to_rgb8().into_raw();

        Self {
            id,
            pixels,
            labels,
            height: size,
            width: size,
        }
    }

    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.pixels.clone())
    }
}

/// One row of an ODIR label file: `image,N,D,G,C,A,H,M,O`.
#[derive(Debug, Deserialize)]
struct LabelRecord {
    image: String,
    #[serde(rename = "N")]
    normal: u8,
    #[serde(rename = "D")]
    diabetes: u8,
    #[serde(rename = "G")]
    glaucoma: u8,
    #[serde(rename = "C")]
    cataract: u8,
    #[serde(rename = "A")]
    amd: u8,
    #[serde(rename = "H")]
    hypertension: u8,
    #[serde(rename = "M")]
    myopia: u8,
    #[serde(rename = "O")]
    others: u8,
}

impl LabelRecord {
    fn labels(&self) -> Result<[u8; NUM_CLASSES]> {
        let labels = [
            self.normal,
            self.diabetes,
            self.glaucoma,
            self.cataract,
            self.amd,
            self.hypertension,
            self.myopia,
            self.others,
        ];
        if let Some(&value) = labels.iter().find(|&&v| v > 1) {
            return Err(OdirError::InvalidLabel {
                image: self.image.clone(),
                value,
            });
        }
        Ok(labels)
    }
}

pub struct OdirDataset {
    pub samples: Vec<OdirSample>,
    pub image_size: usize,
}

impl OdirDataset {
    pub fn from_samples(samples: Vec<OdirSample>, image_size: usize) -> Self {
        Self { samples, image_size }
    }

    /// Read a label file and load every referenced image from `image_dir`.
    /// Images that cannot be opened are skipped with a warning.
    pub fn from_csv(csv_path: &Path, image_dir: &Path, image_size: usize) -> Result<Self> {
        if !csv_path.exists() {
            return Err(OdirError::PathNotFound(csv_path.to_path_buf()));
        }
        if !image_dir.is_dir() {
            return Err(OdirError::PathNotFound(image_dir.to_path_buf()));
        }

        let mut reader = csv::Reader::from_path(csv_path).map_err(|source| OdirError::LabelFile {
            path: csv_path.to_path_buf(),
            source,
        })?;

        let mut rows: Vec<(PathBuf, String, [u8; NUM_CLASSES])> = Vec::new();
        for record in reader.deserialize::<LabelRecord>() {
            let record = record.map_err(|source| OdirError::LabelFile {
                path: csv_path.to_path_buf(),
                source,
            })?;
            let labels = record.labels()?;
            let id = Path::new(&record.image)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| record.image.clone());
            rows.push((image_dir.join(&record.image), id, labels));
        }

        log::info!("Loading {} images listed in {:?}", rows.len(), csv_path);
        let pb = ProgressBar::new(rows.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut samples = Vec::with_capacity(rows.len());
        for (path, id, labels) in rows {
            match image::open(&path) {
                Ok(img) => samples.push(OdirSample::from_image(id, &img, labels, image_size)),
                Err(e) => log::warn!("Skipping {:?}: {}", path, e),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(Self { samples, image_size })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get_batch(&self, indices: &[usize]) -> Vec<OdirSample> {
        indices
            .iter()
            .filter_map(|&idx| self.samples.get(idx))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.id.clone()).collect()
    }

    /// Multi-hot targets, one row per sample.
    pub fn targets(&self) -> Vec<[u8; NUM_CLASSES]> {
        self.samples.iter().map(|s| s.labels).collect()
    }

    /// Number of positive labels per class.
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0usize; NUM_CLASSES];
        for sample in &self.samples {
            for (count, &label) in counts.iter_mut().zip(sample.labels.iter()) {
                *count += label as usize;
            }
        }
        counts
    }
}

/// Load the `(train, test)` split described by the config.
pub fn load_data(config: &ExperimentConfig) -> Result<(OdirDataset, OdirDataset)> {
    let image_dir = config.image_dir_path();

    let train = OdirDataset::from_csv(&config.train_csv_path(), &image_dir, config.image_size)?;
    if train.is_empty() {
        return Err(OdirError::EmptySplit("train".to_string()));
    }

    let test = OdirDataset::from_csv(&config.test_csv_path(), &image_dir, config.image_size)?;
    if test.is_empty() {
        return Err(OdirError::EmptySplit("test".to_string()));
    }

    Ok((train, test))
}

#[derive(Clone, Debug)]
pub struct OdirBatcher {
    preprocessing: Preprocessing,
}

impl OdirBatcher {
    pub fn new(preprocessing: Preprocessing) -> Self {
        Self { preprocessing }
    }
}

#[derive(Debug, Clone)]
pub struct OdirBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> Batcher<B, OdirSample, OdirBatch<B>> for OdirBatcher {
    fn batch(&self, items: Vec<OdirSample>, device: &B::Device) -> OdirBatch<B> {
        let batch_size = items.len();

        if batch_size == 0 {
            return OdirBatch {
                images: Tensor::zeros([0, 3, 1, 1], device),
                targets: Tensor::zeros([0, NUM_CLASSES], device),
            };
        }

        let height = items[0].height;
        let width = items[0].width;

        let mut image_buffer = Vec::with_capacity(batch_size * 3 * height * width);
        let mut label_buffer = Vec::with_capacity(batch_size * NUM_CLASSES);

        for item in &items {
            image_buffer.extend(self.preprocessing.apply(&item.pixels, height, width));
            label_buffer.extend(item.labels.iter().map(|&v| v as i64));
        }

        let images = Tensor::from_data(
            TensorData::new(image_buffer, Shape::new([batch_size, 3, height, width])),
            device,
        );
        let targets = Tensor::from_data(
            TensorData::new(label_buffer, Shape::new([batch_size, NUM_CLASSES])),
            device,
        );

        OdirBatch { images, targets }
    }
}

/// Splits a dataset into index batches, reshuffled every epoch when asked to.
pub struct OdirDataLoader {
    pub dataset: Arc<OdirDataset>,
    batch_size: usize,
    shuffle: bool,
}

impl OdirDataLoader {
    pub fn new(dataset: Arc<OdirDataset>, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
        }
    }

    pub fn batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        indices.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;
    use rand::SeedableRng;

    type TestBackend = NdArray;

    pub(crate) fn synthetic_sample(id: &str, labels: [u8; NUM_CLASSES], size: usize, shade: u8) -> OdirSample {
        OdirSample {
            id: id.to_string(),
            pixels: vec![shade; size * size * 3],
            labels,
            height: size,
            width: size,
        }
    }

    fn write_fixture(dir: &Path) {
        let images = dir.join("images");
        std::fs::create_dir_all(&images).unwrap();
        RgbImage::from_pixel(40, 30, Rgb([200, 10, 10])).save(images.join("1_left.png")).unwrap();
        RgbImage::from_pixel(20, 20, Rgb([0, 255, 0])).save(images.join("2_right.png")).unwrap();
        std::fs::write(images.join("3_left.png"), b"not an image").unwrap();

        std::fs::write(
            dir.join("labels.csv"),
            "image,N,D,G,C,A,H,M,O\n\
             1_left.png,0,1,0,0,0,1,0,0\n\
             2_right.png,1,0,0,0,0,0,0,0\n\
             3_left.png,0,0,0,0,0,0,0,1\n",
        )
        .unwrap();
    }

    #[test]
    fn class_order_matches_label_columns() {
        let codes: String = DiseaseClass::ALL.iter().map(|c| c.code()).collect();
        assert_eq!(codes, "NDGCAHMO");
        for (i, class) in DiseaseClass::ALL.iter().enumerate() {
            assert_eq!(class.to_index(), i);
        }
        assert_eq!(DiseaseClass::names()[4], "AMD");
    }

    #[test]
    fn caffe_preprocessing_swaps_to_bgr_and_centres() {
        let pixels = [10u8, 20, 30];
        let out = Preprocessing::Caffe.apply(&pixels, 1, 1);
        assert!((out[0] - (30.0 - 103.939)).abs() < 1e-4);
        assert!((out[1] - (20.0 - 116.779)).abs() < 1e-4);
        assert!((out[2] - (10.0 - 123.68)).abs() < 1e-4);
    }

    #[test]
    fn torch_preprocessing_is_channel_first() {
        // Two pixels: pure red then pure blue.
        let pixels = [255u8, 0, 0, 0, 0, 255];
        let out = Preprocessing::Torch.apply(&pixels, 1, 2);
        assert_eq!(out.len(), 6);
        assert!((out[0] - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((out[1] - (0.0 - 0.485) / 0.229).abs() < 1e-4);
        assert!((out[5] - (1.0 - 0.406) / 0.225).abs() < 1e-4);
    }

    #[test]
    fn loads_labels_and_skips_unreadable_images() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());

        let dataset = OdirDataset::from_csv(&dir.path().join("labels.csv"), &dir.path().join("images"), 16).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.ids(), vec!["1_left".to_string(), "2_right".to_string()]);
        let first = &dataset.samples[0];
        assert_eq!(first.labels, [0, 1, 0, 0, 0, 1, 0, 0]);
        assert_eq!(first.pixels.len(), 16 * 16 * 3);
        assert_eq!(dataset.class_counts(), [1, 1, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn rejects_non_binary_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        std::fs::write(dir.path().join("labels.csv"), "image,N,D,G,C,A,H,M,O\n1_left.png,2,0,0,0,0,0,0,0\n").unwrap();

        let err = OdirDataset::from_csv(&dir.path().join("labels.csv"), &dir.path().join("images"), 16)
            .err()
            .unwrap();
        assert!(matches!(err, OdirError::InvalidLabel { value: 2, .. }));
    }

    #[test]
    fn missing_label_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = OdirDataset::from_csv(&dir.path().join("missing.csv"), dir.path(), 16)
            .err()
            .unwrap();
        assert!(matches!(err, OdirError::PathNotFound(_)));
    }

    #[test]
    fn load_data_fails_on_empty_split() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        std::fs::write(dir.path().join("empty.csv"), "image,N,D,G,C,A,H,M,O\n").unwrap();

        let config = ExperimentConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            train_csv: "labels.csv".to_string(),
            test_csv: "empty.csv".to_string(),
            image_size: 16,
            ..Default::default()
        };
        let err = load_data(&config).err().unwrap();
        assert!(matches!(err, OdirError::EmptySplit(ref split) if split == "test"));
    }

    #[test]
    fn batcher_builds_image_and_target_tensors() {
        let device = Default::default();
        let items = vec![
            synthetic_sample("a", [1, 0, 0, 0, 0, 0, 0, 0], 8, 10),
            synthetic_sample("b", [0, 0, 1, 0, 0, 0, 1, 0], 8, 200),
        ];

        let batch: OdirBatch<TestBackend> = OdirBatcher::new(Preprocessing::Torch).batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), [2, NUM_CLASSES]);
        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(&targets[8..], &[0, 0, 1, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn loader_covers_every_index_once() {
        let samples = (0..10)
            .map(|i| synthetic_sample(&i.to_string(), [0; NUM_CLASSES], 4, 0))
            .collect();
        let loader = OdirDataLoader::new(Arc::new(OdirDataset::from_samples(samples, 4)), 4, true);
        let mut rng = StdRng::seed_from_u64(1);

        let batches = loader.batches(&mut rng);
        assert_eq!(batches.len(), loader.num_batches());
        assert_eq!(batches.last().map(|b| b.len()), Some(2));

        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
