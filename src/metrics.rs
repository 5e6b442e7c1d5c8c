use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::data::NUM_CLASSES;
use crate::predictions::{read_rows, GROUND_TRUTH_FILE, PREDICTIONS_FILE};

/// Threshold metrics over flattened multi-label outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub auc: f64,
}

/// Counts of a thresholded binary comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub tp: usize,
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
}

impl Counts {
    pub fn from_scores(scores: &[f32], targets: &[u8], threshold: f64) -> Self {
        let mut counts = Counts::default();
        for (&score, &target) in scores.iter().zip(targets.iter()) {
            match (score as f64 > threshold, target == 1) {
                (true, true) => counts.tp += 1,
                (false, false) => counts.tn += 1,
                (true, false) => counts.fp += 1,
                (false, true) => counts.fn_ += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    /// Micro-averaged F1 over both labels of a flattened binary problem. Pooling
    /// the counts of the positive and negative label makes it equal to accuracy.
    pub fn micro_f1(&self) -> f64 {
        let tp = self.tp + self.tn;
        let fp = self.fp + self.fn_;
        ratio(2 * tp, 2 * tp + 2 * fp)
    }

    /// Cohen's kappa between truth and thresholded prediction.
    pub fn kappa(&self) -> f64 {
        let n = self.total() as f64;
        if n == 0.0 {
            return 0.0;
        }
        let observed = (self.tp + self.tn) as f64 / n;
        let true_pos = (self.tp + self.fn_) as f64 / n;
        let pred_pos = (self.tp + self.fp) as f64 / n;
        let expected = true_pos * pred_pos + (1.0 - true_pos) * (1.0 - pred_pos);

        if (1.0 - expected).abs() < f64::EPSILON {
            0.0
        } else {
            (observed - expected) / (1.0 - expected)
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl BinaryMetrics {
    pub fn compute(scores: &[f32], targets: &[u8], threshold: f64) -> Self {
        let counts = Counts::from_scores(scores, targets, threshold);
        Self {
            accuracy: counts.accuracy(),
            precision: counts.precision(),
            recall: counts.recall(),
            auc: roc_auc(scores, targets),
        }
    }

    /// Value of a metric by its history name, `loss` excluded.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "accuracy" => Some(self.accuracy),
            "precision" => Some(self.precision),
            "recall" => Some(self.recall),
            "auc" => Some(self.auc),
            _ => None,
        }
    }

    /// `name : value` lines in [`History::METRIC_NAMES`] order.
    pub fn summary_lines(&self, loss: f64) -> Vec<String> {
        History::METRIC_NAMES
            .iter()
            .filter_map(|&name| {
                let value = if name == "loss" { Some(loss) } else { self.get(name) };
                value.map(|v| format!("{} :  {:.4}", name, v))
            })
            .collect()
    }

    pub fn print_summary(&self, loss: f64) {
        for line in self.summary_lines(loss) {
            println!("{}", line);
        }
    }
}

/// Area under the ROC curve via the rank statistic, ties averaged.
/// Returns 0.5 when only one class is present.
pub fn roc_auc(scores: &[f32], targets: &[u8]) -> f64 {
    let n = scores.len().min(targets.len());
    let positives = targets[..n].iter().filter(|&&t| t == 1).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0f64;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied run i..=j shares the mean rank.
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if targets[idx] == 1 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let p = positives as f64;
    (rank_sum_pos - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

pub fn flatten_scores(rows: &[[f32; NUM_CLASSES]]) -> Vec<f32> {
    rows.iter().flat_map(|r| r.iter().copied()).collect()
}

pub fn flatten_targets(rows: &[[u8; NUM_CLASSES]]) -> Vec<u8> {
    rows.iter().flat_map(|r| r.iter().copied()).collect()
}

fn argmax<T: PartialOrd + Copy>(row: &[T]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Rows are the true class (argmax of the label row), columns the predicted one.
pub fn confusion_matrix(
    targets: &[[u8; NUM_CLASSES]],
    predictions: &[[f32; NUM_CLASSES]],
) -> [[usize; NUM_CLASSES]; NUM_CLASSES] {
    let mut matrix = [[0usize; NUM_CLASSES]; NUM_CLASSES];
    for (target, pred) in targets.iter().zip(predictions.iter()) {
        matrix[argmax(target)][argmax(pred)] += 1;
    }
    matrix
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub train: BinaryMetrics,
    pub val_loss: f64,
    pub val: BinaryMetrics,
    pub learning_rate: f64,
}

/// Per-epoch record of a `fit` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochMetrics>,
    pub stopped_early: bool,
}

impl History {
    pub const METRIC_NAMES: [&'static str; 5] = ["loss", "accuracy", "precision", "recall", "auc"];

    pub fn add(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Values of `name` (`loss`, `val_auc`, ...) per epoch.
    pub fn series(&self, name: &str) -> Option<Vec<f64>> {
        let (val, metric) = match name.strip_prefix("val_") {
            Some(rest) => (true, rest),
            None => (false, name),
        };

        let pick = |e: &EpochMetrics| -> Option<f64> {
            let m = if val { &e.val } else { &e.train };
            match metric {
                "loss" => Some(if val { e.val_loss } else { e.loss }),
                _ => m.get(metric),
            }
        };

        self.epochs.iter().map(pick).collect()
    }

    /// Epoch with the lowest validation loss.
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().min_by(|a, b| a.val_loss.total_cmp(&b.val_loss))
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn print_history(&self) {
        println!("┌───────┬──────────┬──────────┬──────────┬──────────┬──────────┬──────────┬────────────┐");
        println!("│ Epoch │ Loss     │ Val Loss │ Acc      │ Val Acc  │ AUC      │ Val AUC  │ LR         │");
        println!("├───────┼──────────┼──────────┼──────────┼──────────┼──────────┼──────────┼────────────┤");
        for e in &self.epochs {
            println!(
                "│ {:5} │ {:8.4} │ {:8.4} │ {:8.4} │ {:8.4} │ {:8.4} │ {:8.4} │ {:10.6} │",
                e.epoch, e.loss, e.val_loss, e.train.accuracy, e.val.accuracy, e.train.auc, e.val.auc, e.learning_rate
            );
        }
        println!("└───────┴──────────┴──────────┴──────────┴──────────┴──────────┴──────────┴────────────┘");

        if let Some(best) = self.best_epoch() {
            println!("Best epoch: {} with val_loss {:.4}", best.epoch, best.val_loss);
        }
    }
}

/// Stops once the monitored value has not decreased for `patience` epochs.
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    pub best: f64,
    pub best_epoch: usize,
    counter: usize,
    pub stopped: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            best_epoch: 0,
            counter: 0,
            stopped: false,
        }
    }

    pub fn should_stop(&mut self, epoch: usize, current: f64) -> bool {
        if self.stopped {
            return true;
        }

        if current < self.best - self.min_delta {
            self.best = current;
            self.best_epoch = epoch;
            self.counter = 0;
            return false;
        }

        self.counter += 1;
        if self.counter >= self.patience {
            self.stopped = true;
            log::info!("Epoch {}: early stopping (no val_loss improvement for {} epochs)", epoch, self.patience);
        }
        self.stopped
    }
}

/// ODIR challenge score: mean of Cohen's kappa, micro F1 and ROC AUC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinalScore {
    pub kappa: f64,
    pub f1: f64,
    pub auc: f64,
    pub score: f64,
}

impl FinalScore {
    pub const THRESHOLD: f64 = 0.5;

    pub fn compute(targets: &[[u8; NUM_CLASSES]], predictions: &[[f32; NUM_CLASSES]]) -> Self {
        let gt = flatten_targets(targets);
        let pr = flatten_scores(predictions);

        let counts = Counts::from_scores(&pr, &gt, Self::THRESHOLD);
        let kappa = counts.kappa();
        let f1 = counts.micro_f1();
        let auc = roc_auc(&pr, &gt);

        Self {
            kappa,
            f1,
            auc,
            score: (kappa + f1 + auc) / 3.0,
        }
    }

    /// Score the ground-truth and prediction files written into a run folder.
    pub fn from_folder(folder: &Path) -> anyhow::Result<Self> {
        let gt_rows = read_rows(&folder.join(GROUND_TRUTH_FILE))?;
        let pr_rows = read_rows(&folder.join(PREDICTIONS_FILE))?;
        if gt_rows.len() != pr_rows.len() {
            anyhow::bail!("ground truth has {} rows, predictions {}", gt_rows.len(), pr_rows.len());
        }

        let targets: Vec<[u8; NUM_CLASSES]> = gt_rows
            .iter()
            .map(|(_, row)| {
                let mut t = [0u8; NUM_CLASSES];
                for (dst, &v) in t.iter_mut().zip(row.iter()) {
                    *dst = (v > 0.5) as u8;
                }
                t
            })
            .collect();
        let predictions: Vec<[f32; NUM_CLASSES]> = pr_rows.into_iter().map(|(_, row)| row).collect();

        Ok(Self::compute(&targets, &predictions))
    }

    pub fn output(&self) {
        println!("Kappa score: {:.4}", self.kappa);
        println!("F-1 score: {:.4}", self.f1);
        println!("AUC value: {:.4}", self.auc);
        println!("Final Score: {:.4}", self.score);
    }
}
