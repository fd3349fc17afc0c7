//! Per-class top-1 accuracy.
//!
//! Every screenshot holds exactly one box of each foreground class. For each
//! image and class, the box with the highest score for that class is taken as
//! the prediction; it is correct iff it is the ground-truth box of that class.

use serde::Serialize;
use tracing::info;

use crate::sample::BACKGROUND_LABEL;

/// Index of the highest-scoring box for every class, `None` when there are no
/// boxes. `scores` is `[n_boxes][n_classes]`.
pub fn top_box_per_class(scores: &[Vec<f32>], n_classes: usize) -> Vec<Option<usize>> {
    (0..n_classes)
        .map(|c| {
            scores
                .iter()
                .enumerate()
                .max_by(|a, b| a.1[c].total_cmp(&b.1[c]))
                .map(|(i, _)| i)
        })
        .collect()
}

/// Running per-class accuracy over a split.
#[derive(Debug, Clone, Serialize)]
pub struct ClassAccuracy {
    n_classes: usize,
    correct: Vec<usize>,
    total: Vec<usize>,
}

/// Serializable summary, one entry per foreground class.
#[derive(Debug, Clone, Serialize)]
pub struct AccuracyReport {
    pub images: usize,
    pub per_class: Vec<(String, f32)>,
    pub mean: f32,
}

impl ClassAccuracy {
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            correct: vec![0; n_classes],
            total: vec![0; n_classes],
        }
    }

    /// Score one image. `scores` is `[n_boxes][n_classes]`, `labels` is
    /// `[n_boxes]`. Classes without a ground-truth box in the image are skipped.
    pub fn update(&mut self, scores: &[Vec<f32>], labels: &[u32]) {
        let top = top_box_per_class(scores, self.n_classes);
        for class in self.foreground() {
            let Some(gt) = labels.iter().position(|&l| l as usize == class) else {
                continue;
            };
            self.total[class] += 1;
            if top[class] == Some(gt) {
                self.correct[class] += 1;
            }
        }
    }

    pub fn accuracy(&self, class: usize) -> f32 {
        if self.total[class] == 0 {
            0.0
        } else {
            self.correct[class] as f32 / self.total[class] as f32
        }
    }

    /// Mean accuracy over the foreground classes.
    pub fn mean(&self) -> f32 {
        let classes: Vec<usize> = self.foreground().collect();
        if classes.is_empty() {
            return 0.0;
        }
        classes.iter().map(|&c| self.accuracy(c)).sum::<f32>() / classes.len() as f32
    }

    /// Number of images scored, counted through the first foreground class.
    pub fn images(&self) -> usize {
        self.foreground().map(|c| self.total[c]).max().unwrap_or(0)
    }

    pub fn report(&self, class_names: &[String]) -> AccuracyReport {
        let per_class = self
            .foreground()
            .map(|c| {
                let name = class_names
                    .get(c)
                    .cloned()
                    .unwrap_or_else(|| c.to_string());
                (name, self.accuracy(c))
            })
            .collect();
        AccuracyReport {
            images: self.images(),
            per_class,
            mean: self.mean(),
        }
    }

    pub fn log_summary(&self, split: &str, class_names: &[String]) {
        let report = self.report(class_names);
        for (name, acc) in &report.per_class {
            info!("{split} {name:>10} accuracy: {:.2}%", 100.0 * acc);
        }
        info!(
            "{split} mean accuracy: {:.2}% over {} images",
            100.0 * report.mean,
            report.images
        );
    }

    fn foreground(&self) -> impl Iterator<Item = usize> {
        (0..self.n_classes).filter(|&c| c as u32 != BACKGROUND_LABEL)
    }
}
