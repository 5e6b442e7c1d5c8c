use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    nn::loss::BinaryCrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::{activation::sigmoid, backend::AutodiffBackend, ElementConversion, TensorData},
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::ExperimentConfig,
    data::{OdirBatch, OdirBatcher, OdirDataLoader, OdirDataset, NUM_CLASSES},
    metrics::{BinaryMetrics, EarlyStopping, EpochMetrics, History},
    model::{OcularModel, ResNet},
};

/// Keras-style time decay: `lr / (1 + decay * iterations)`, stepped per batch.
#[derive(Debug, Clone)]
pub struct InverseTimeDecay {
    initial: f64,
    decay: f64,
    iterations: usize,
}

impl InverseTimeDecay {
    pub fn new(initial: f64, decay: f64) -> Self {
        Self {
            initial,
            decay,
            iterations: 0,
        }
    }

    pub fn current(&self) -> f64 {
        self.initial / (1.0 + self.decay * self.iterations as f64)
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.current();
        self.iterations += 1;
        lr
    }
}

/// Output of one pass over a dataset without gradient tracking.
struct Pass {
    loss: f64,
    scores: Vec<f32>,
    targets: Vec<u8>,
}

pub struct OdirTrainer<B: AutodiffBackend> {
    pub model: OcularModel<B>,
    /// Inference copy of the backbone used while it is frozen: its weights and
    /// batch-norm statistics never see the autodiff graph.
    frozen_backbone: Option<ResNet<B::InnerBackend>>,
    batcher: OdirBatcher,
    pub device: B::Device,
    pub config: ExperimentConfig,
    schedule: InverseTimeDecay,
}

impl<B: AutodiffBackend> OdirTrainer<B> {
    pub fn new(model: OcularModel<B>, config: ExperimentConfig, device: B::Device) -> Self {
        let (model, frozen_backbone) = if config.freeze_backbone {
            let backbone = model.backbone.no_grad();
            let frozen = backbone.valid();
            (
                OcularModel {
                    backbone,
                    head: model.head,
                },
                Some(frozen),
            )
        } else {
            (model, None)
        };

        Self {
            model,
            frozen_backbone,
            batcher: OdirBatcher::new(config.preprocessing),
            device,
            schedule: InverseTimeDecay::new(config.learning_rate, config.lr_decay),
            config,
        }
    }

    pub fn is_backbone_frozen(&self) -> bool {
        self.frozen_backbone.is_some()
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.current()
    }

    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.frozen_backbone {
            Some(backbone) => Tensor::from_inner(backbone.forward(images.inner())),
            None => self.model.backbone.forward(images),
        }
    }

    pub fn train_epoch<O>(
        &mut self,
        loader: &OdirDataLoader,
        optimizer: &mut O,
        rng: &mut StdRng,
    ) -> Result<(f64, BinaryMetrics)>
    where
        O: Optimizer<OcularModel<B>, B>,
    {
        let loss_fn = BinaryCrossEntropyLossConfig::new().with_logits(true).init(&self.device);

        let mut total_loss = 0.0;
        let mut total_samples = 0usize;
        let mut scores = Vec::with_capacity(loader.len() * NUM_CLASSES);
        let mut targets = Vec::with_capacity(loader.len() * NUM_CLASSES);

        let batches = loader.batches(rng);
        let pb = ProgressBar::new(batches.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  [{elapsed_precise}] {bar:40.green/white} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for batch_indices in &batches {
            let items = loader.dataset.get_batch(batch_indices);
            if items.is_empty() {
                continue;
            }
            let batch_size = items.len();
            targets.extend(items.iter().flat_map(|s| s.labels));

            let batch: OdirBatch<B> = self.batcher.batch(items, &self.device);

            let logits = self.model.head.forward(self.features(batch.images));
            let loss = loss_fn.forward(logits.clone(), batch.targets);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            total_loss += loss_value * batch_size as f64;
            total_samples += batch_size;
            scores.extend(tensor_to_vec(sigmoid(logits.inner()))?);

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            let lr = self.schedule.step();
            self.model = optimizer.step(lr, self.model.clone(), grads);

            pb.set_message(format!("loss {:.4}", loss_value));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let avg_loss = total_loss / total_samples.max(1) as f64;
        let metrics = BinaryMetrics::compute(&scores, &targets, self.config.threshold);

        Ok((avg_loss, metrics))
    }

    fn inference_pass(&self, dataset: &OdirDataset) -> Result<Pass> {
        let model = self.model.valid();
        let loss_fn = BinaryCrossEntropyLossConfig::new().with_logits(true).init(&self.device);

        let mut total_loss = 0.0;
        let mut scores = Vec::with_capacity(dataset.len() * NUM_CLASSES);
        let mut targets = Vec::with_capacity(dataset.len() * NUM_CLASSES);

        let indices: Vec<usize> = (0..dataset.len()).collect();
        for chunk in indices.chunks(self.config.batch_size.max(1)) {
            let items = dataset.get_batch(chunk);
            let batch_size = items.len();
            targets.extend(items.iter().flat_map(|s| s.labels));

            let batch: OdirBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets);

            let loss_value: f64 = loss.into_scalar().elem();
            total_loss += loss_value * batch_size as f64;
            scores.extend(tensor_to_vec(sigmoid(logits))?);
        }

        Ok(Pass {
            loss: total_loss / dataset.len().max(1) as f64,
            scores,
            targets,
        })
    }

    /// Loss and metrics on `dataset`, in evaluation mode.
    pub fn evaluate(&self, dataset: &OdirDataset) -> Result<(f64, BinaryMetrics)> {
        let pass = self.inference_pass(dataset)?;
        let metrics = BinaryMetrics::compute(&pass.scores, &pass.targets, self.config.threshold);
        Ok((pass.loss, metrics))
    }

    /// Sigmoid probabilities, one row per sample in dataset order.
    pub fn predict(&self, dataset: &OdirDataset) -> Result<Vec<[f32; NUM_CLASSES]>> {
        let pass = self.inference_pass(dataset)?;
        if pass.scores.len() != dataset.len() * NUM_CLASSES {
            return Err(anyhow!(
                "Expected {} scores for {} samples, got {}",
                dataset.len() * NUM_CLASSES,
                dataset.len(),
                pass.scores.len()
            ));
        }

        Ok(pass
            .scores
            .chunks_exact(NUM_CLASSES)
            .map(|row| {
                let mut out = [0f32; NUM_CLASSES];
                out.copy_from_slice(row);
                out
            })
            .collect())
    }

    pub fn fit(&mut self, train: Arc<OdirDataset>, validation: Arc<OdirDataset>) -> Result<History> {
        let train_loader = OdirDataLoader::new(train, self.config.batch_size, self.config.shuffle);

        let mut optimizer = self.config.sgd().init::<B, OcularModel<B>>();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut early_stopping = EarlyStopping::new(self.config.patience, 0.0);
        let mut history = History::default();

        log::info!(
            "Train on {} samples, validate on {} samples",
            train_loader.len(),
            validation.len()
        );
        log::info!(
            "Epochs: {}, batch size: {}, batches per epoch: {}, backbone frozen: {}",
            self.config.epochs,
            self.config.batch_size,
            train_loader.num_batches(),
            self.is_backbone_frozen()
        );

        for epoch in 1..=self.config.epochs {
            println!("\nEpoch {}/{}", epoch, self.config.epochs);

            let (loss, train) = self.train_epoch(&train_loader, &mut optimizer, &mut rng)?;
            let (val_loss, val) = self.evaluate(&validation)?;

            println!(
                "loss: {:.4} - accuracy: {:.4} - precision: {:.4} - recall: {:.4} - auc: {:.4} - \
                 val_loss: {:.4} - val_accuracy: {:.4} - val_precision: {:.4} - val_recall: {:.4} - val_auc: {:.4}",
                loss, train.accuracy, train.precision, train.recall, train.auc,
                val_loss, val.accuracy, val.precision, val.recall, val.auc
            );

            history.add(EpochMetrics {
                epoch,
                loss,
                train,
                val_loss,
                val,
                learning_rate: self.schedule.current(),
            });

            if early_stopping.should_stop(epoch, val_loss) {
                history.stopped_early = true;
                break;
            }
        }

        log::info!("Training finished after {} epochs", history.len());
        history.print_history();

        Ok(history)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.model
            .clone()
            .save_file(path, &CompactRecorder::new())
            .map_err(|e| anyhow!("Failed to save model to {:?}: {:?}", path, e))?;
        log::info!("Model saved to {:?}", path);
        Ok(())
    }
}

fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    data_to_vec(tensor.into_data().convert::<f32>())
}

fn data_to_vec(data: TensorData) -> Result<Vec<f32>> {
    data.to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::tests::synthetic_sample,
        model::{OcularModelConfig, ResNetConfig},
    };
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn tiny_dataset() -> OdirDataset {
        let samples = vec![
            synthetic_sample("a", [1, 0, 0, 0, 0, 0, 0, 0], 32, 20),
            synthetic_sample("b", [0, 1, 0, 0, 0, 0, 0, 0], 32, 80),
            synthetic_sample("c", [0, 0, 1, 0, 0, 1, 0, 0], 32, 140),
            synthetic_sample("d", [0, 0, 0, 0, 0, 0, 0, 1], 32, 220),
        ];
        OdirDataset::from_samples(samples, 32)
    }

    fn tiny_trainer(freeze_backbone: bool) -> OdirTrainer<TestBackend> {
        let device = Default::default();
        let config = ExperimentConfig {
            image_size: 32,
            batch_size: 2,
            epochs: 2,
            hidden_units: 16,
            freeze_backbone,
            ..Default::default()
        };
        let model = OcularModelConfig::new(ResNetConfig::new([1, 1, 1, 1]), NUM_CLASSES)
            .with_hidden_units(16)
            .init::<TestBackend>(&device);
        OdirTrainer::new(model, config, device)
    }

    fn snapshot(trainer: &OdirTrainer<TestBackend>) -> (Vec<f32>, Vec<f32>) {
        let device = Default::default();
        let model = trainer.model.valid();
        let input = Tensor::<NdArray, 4>::ones([1, 3, 32, 32], &device);
        let features = model.backbone.forward(input);
        let logits = model.head.forward(features.clone());
        (
            features.into_data().to_vec().unwrap(),
            logits.into_data().to_vec().unwrap(),
        )
    }

    #[test]
    fn time_decay_follows_keras_formula() {
        let mut schedule = InverseTimeDecay::new(0.01, 0.5);
        assert!((schedule.step() - 0.01).abs() < 1e-12);
        assert!((schedule.step() - 0.01 / 1.5).abs() < 1e-12);
        assert!((schedule.current() - 0.01 / 2.0).abs() < 1e-12);
    }

    #[test]
    fn frozen_backbone_is_untouched_by_training() {
        let mut trainer = tiny_trainer(true);
        assert!(trainer.is_backbone_frozen());
        let (features_before, logits_before) = snapshot(&trainer);

        let loader = OdirDataLoader::new(Arc::new(tiny_dataset()), 2, true);
        let mut optimizer = trainer.config.sgd().init::<TestBackend, OcularModel<TestBackend>>();
        let mut rng = StdRng::seed_from_u64(0);
        let (loss, metrics) = trainer.train_epoch(&loader, &mut optimizer, &mut rng).unwrap();

        assert!(loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        let (features_after, logits_after) = snapshot(&trainer);
        assert_eq!(features_before, features_after);
        assert_ne!(logits_before, logits_after);
        assert!(trainer.learning_rate() < trainer.config.learning_rate);
    }

    #[test]
    fn unfrozen_backbone_trains_too() {
        let mut trainer = tiny_trainer(false);
        assert!(!trainer.is_backbone_frozen());
        let (features_before, _) = snapshot(&trainer);

        let loader = OdirDataLoader::new(Arc::new(tiny_dataset()), 2, false);
        let mut optimizer = trainer.config.sgd().init::<TestBackend, OcularModel<TestBackend>>();
        let mut rng = StdRng::seed_from_u64(0);
        trainer.train_epoch(&loader, &mut optimizer, &mut rng).unwrap();

        let (features_after, _) = snapshot(&trainer);
        assert_ne!(features_before, features_after);
    }

    #[test]
    fn fit_records_every_epoch() {
        let mut trainer = tiny_trainer(true);
        let train = Arc::new(tiny_dataset());
        let validation = Arc::new(tiny_dataset());

        let history = trainer.fit(train, validation).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history.stopped_early);
        assert!(history.series("val_loss").unwrap().iter().all(|l| l.is_finite()));
    }

    #[test]
    fn predict_returns_probabilities_in_order() {
        let trainer = tiny_trainer(true);
        let dataset = tiny_dataset();

        let predictions = trainer.predict(&dataset).unwrap();
        assert_eq!(predictions.len(), dataset.len());
        assert!(predictions.iter().flatten().all(|&p| (0.0..=1.0).contains(&p)));

        let (loss, _) = trainer.evaluate(&dataset).unwrap();
        assert!(loss > 0.0);
    }

    #[test]
    fn tensor_readback_reports_type_mismatch() {
        let device = Default::default();
        let probs = Tensor::<NdArray, 2>::from_floats([[0.25, 0.75]], &device);
        assert_eq!(tensor_to_vec(probs).unwrap(), vec![0.25, 0.75]);

        assert!(data_to_vec(TensorData::from([1i64, 2])).is_err());
    }

    #[test]
    fn save_writes_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = tiny_trainer(true);
        trainer.save(&dir.path().join("model_weights")).unwrap();
        assert!(dir.path().join("model_weights.mpk").exists());
    }
}
