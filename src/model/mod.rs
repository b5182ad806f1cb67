use ndarray::{Array2, ArrayView4, Axis};

use crate::error::Result;
use crate::metrics::{EpochMetrics, MetricsSink};
use crate::parsing::Dataset;

pub mod conv;
pub mod conv_net;
pub mod neural_net;
pub mod optim;

pub trait Model {
    /// Train on `train`, reporting every epoch to `sink`
    fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        sink: &mut dyn MetricsSink,
    ) -> Result<Vec<EpochMetrics>>;

    /// Class probabilities for a batch of [n, 1, rows, cols] inputs
    fn predict(&self, inputs: &ArrayView4<f64>) -> Array2<f64>;
}

/// Per-example outcome of running a model over a labelled set
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub labels: Vec<u8>,
    pub predictions: Vec<u8>,
}

impl Evaluation {
    pub fn correct(&self) -> Vec<bool> {
        self.labels
            .iter()
            .zip(&self.predictions)
            .map(|(label, prediction)| label == prediction)
            .collect()
    }

    /// Share of correct predictions, 0 for an empty set
    pub fn accuracy(&self) -> f64 {
        if self.labels.is_empty() {
            return 0f64;
        }

        let hits = self.correct().into_iter().filter(|&hit| hit).count();
        hits as f64 / self.labels.len() as f64
    }

    /// Accuracy of each class, `None` for classes absent from the set
    pub fn per_class_accuracy(&self, num_classes: usize) -> Vec<Option<f64>> {
        let mut seen = vec![0usize; num_classes];
        let mut hits = vec![0usize; num_classes];

        for (&label, hit) in self.labels.iter().zip(self.correct()) {
            if let Some(count) = seen.get_mut(label as usize) {
                *count += 1;
                if hit {
                    hits[label as usize] += 1;
                }
            }
        }

        seen.iter()
            .zip(hits)
            .map(|(&n, h)| (n > 0).then(|| h as f64 / n as f64))
            .collect()
    }
}

/// Run the model over `dataset` in batches and compare its top class with the labels
pub fn evaluate<M: Model + ?Sized>(model: &M, dataset: &Dataset, batch_size: usize) -> Evaluation {
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut predictions = Vec::with_capacity(dataset.len());

    for batch in indices.chunks(batch_size.max(1)) {
        let probabilities = model.predict(&dataset.features(batch).view());
        predictions.extend(
            probabilities
                .axis_iter(Axis(0))
                .map(|row| neural_net::argmax(row) as u8),
        );
    }

    Evaluation {
        labels: dataset.labels.to_vec(),
        predictions,
    }
}
