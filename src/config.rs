use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use burn::{
    config::Config,
    optim::{momentum::MomentumConfig, SgdConfig},
};

use crate::data::Preprocessing;

/// Every knob of one experiment run. Defaults reproduce the reference run.
#[derive(Config, Debug)]
pub struct ExperimentConfig {
    // Dataset
    #[config(default = "String::from(\"data\")")]
    pub data_dir: String,
    #[config(default = "String::from(\"odir_training.csv\")")]
    pub train_csv: String,
    #[config(default = "String::from(\"odir_testing.csv\")")]
    pub test_csv: String,
    #[config(default = "String::from(\"images\")")]
    pub image_dir: String,
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 8)]
    pub num_classes: usize,
    #[config(default = "Preprocessing::Torch")]
    pub preprocessing: Preprocessing,

    // Model
    /// torchvision `resnet50` state dict; `None` trains from scratch.
    pub pretrained_weights: Option<String>,
    #[config(default = 1024)]
    pub hidden_units: usize,
    #[config(default = true)]
    pub freeze_backbone: bool,

    // Training
    #[config(default = 50)]
    pub epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = true)]
    pub shuffle: bool,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.01)]
    pub learning_rate: f64,
    #[config(default = 1e-6)]
    pub lr_decay: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = true)]
    pub nesterov: bool,

    // Early stopping on val_loss
    #[config(default = 8)]
    pub patience: usize,

    // Evaluation / output
    #[config(default = 0.5)]
    pub threshold: f64,
    #[config(default = "String::from(\"runs\")")]
    pub output_root: String,
    #[config(default = 12)]
    pub output_samples: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentConfig {
    /// Load the config from `path` when it exists, otherwise use the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::new());
        }

        let config = Self::load(path).map_err(|e| anyhow!("Failed to load config {:?}: {:?}", path, e))?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn train_csv_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.train_csv)
    }

    pub fn test_csv_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.test_csv)
    }

    pub fn image_dir_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.image_dir)
    }

    /// SGD with classic (undampened) momentum. The time-based decay is applied
    /// per step by the trainer, not through weight decay.
    pub fn sgd(&self) -> SgdConfig {
        SgdConfig::new().with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(self.momentum)
                .with_dampening(0.0)
                .with_nesterov(self.nesterov),
        ))
    }

    /// Optimizer settings as logged before compiling the model.
    pub fn optimizer_summary(&self) -> String {
        format!(
            "{{'name': 'SGD', 'learning_rate': {}, 'decay': {}, 'momentum': {}, 'nesterov': {}}}",
            self.learning_rate, self.lr_decay, self.momentum, self.nesterov
        )
    }
}
