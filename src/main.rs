mod config;
mod data;
mod error;
mod metrics;
mod model;
mod plot;
mod predictions;
mod trainer;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    config::Config,
};
use env_logger::Env;

use crate::{
    config::ExperimentConfig,
    data::{load_data, DiseaseClass, NUM_CLASSES},
    metrics::{confusion_matrix, FinalScore},
    model::OcularModelConfig,
    plot::{plot_accuracy, plot_confusion_matrix, plot_metrics, plot_output},
    predictions::PredictionWriter,
    trainer::OdirTrainer,
};

const CONFIG_FILE: &str = "odir_config.json";

type Backend = Autodiff<NdArray>;

/// `output_root/<32 hex chars>`, created if missing.
fn create_run_folder(root: &Path) -> Result<PathBuf> {
    let token: [u8; 16] = rand::random();
    let name: String = token.iter().map(|b| format!("{:02x}", b)).collect();
    let folder = root.join(name);
    std::fs::create_dir_all(&folder)?;
    Ok(folder)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    println!("=== ODIR Ocular Disease Classification (ResNet-50 transfer learning) ===");

    let config = ExperimentConfig::load_or_default(Path::new(CONFIG_FILE))?;
    if config.num_classes != NUM_CLASSES {
        bail!("num_classes must be {} for the ODIR labels, got {}", NUM_CLASSES, config.num_classes);
    }

    let folder = create_run_folder(Path::new(&config.output_root))?;
    log::info!("Run folder: {:?}", folder);
    config.save(&folder.join("config.json"))?;

    // Backbone with pretrained weights, new head on top
    let device = NdArrayDevice::Cpu;
    let model = OcularModelConfig::resnet50(config.num_classes)
        .with_hidden_units(config.hidden_units)
        .init_pretrained::<Backend>(config.pretrained_weights.as_deref().map(Path::new), &device)?;

    let summary = model.summary(config.freeze_backbone);
    println!("{}", summary);
    std::fs::write(folder.join("model_resnet50.txt"), &summary)?;

    println!("Configuration Start -------------------------");
    println!("{}", config.optimizer_summary());
    println!("Configuration End -------------------------");

    let mut trainer = OdirTrainer::<Backend>::new(model, config.clone(), device);

    println!("Loading dataset...");
    let (train, test) = load_data(&config)?;
    println!("  Training: {} images, test: {} images", train.len(), test.len());
    for (class, count) in DiseaseClass::ALL.iter().zip(train.class_counts()) {
        log::debug!("  {:<12} {}", class.name(), count);
    }
    let train = Arc::new(train);
    let test = Arc::new(test);

    let history = trainer.fit(Arc::clone(&train), Arc::clone(&test))?;
    history.save_json(&folder.join("history.json"))?;

    println!("saving");
    trainer.save(&folder.join("model_weights"))?;

    println!("plotting");
    plot_metrics(&history, &folder.join("plot1.svg"), 2)?;
    plot_accuracy(&history, &folder.join("plot2.svg"))?;

    let (test_loss, test_metrics) = trainer.evaluate(&test)?;
    test_metrics.print_summary(test_loss);
    println!();

    let predictions = trainer.predict(&test)?;
    let targets = test.targets();
    let class_names = DiseaseClass::names();
    plot_confusion_matrix(
        &confusion_matrix(&targets, &predictions),
        &class_names,
        &folder.join("plot3.svg"),
    )?;

    let writer = PredictionWriter::new(predictions.clone(), test.ids(), &folder)?;
    writer.save()?;
    writer.save_all(&targets)?;

    let score = FinalScore::from_folder(&folder)?;
    score.output();

    plot_output(
        &predictions,
        &test.samples,
        &class_names,
        &folder.join("plot4.svg"),
        config.output_samples,
    )?;

    println!("\n=== Run complete: results in {:?} ===", folder);
    Ok(())
}
