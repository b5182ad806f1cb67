use super::conv::{Conv2D, MaxPool2D};
use super::neural_net::{
    self, activation, cross_entropy, cross_entropy_grad, delta_activation, softmax,
    ActivationFunction, InitMethod, LayerGrads, NeuralNet,
};
use super::optim::{self, Optimizer, OptimizerKind};
use super::Model;
use crate::error::{Error, Result};
use crate::metrics::{EpochMetrics, MetricsSink};
use crate::parsing::Dataset;
use ndarray::{Array1, Array2, Array4, ArrayView4, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Layer sizes of a [`ConvNet`]
#[derive(Debug, Clone)]
pub struct Architecture {
    pub input_shape: (usize, usize),
    pub conv_channels: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub hidden: Vec<usize>,
    pub num_classes: usize,
    pub activation_function: ActivationFunction,
    pub init_method: InitMethod,
}

/// Training hyperparams
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            num_epochs: 20,
            batch_size: 32,
            learning_rate: 0.001,
            optimizer: OptimizerKind::Adam,
            seed: None,
        }
    }
}

/// conv -> activation -> max pool -> flatten -> dense head -> softmax
#[derive(Debug, Clone)]
pub struct ConvNet {
    pub input_shape: (usize, usize),
    pub conv: Conv2D,
    pub pool: MaxPool2D,
    pub head: NeuralNet,
    pub training: TrainingConfig,
}

/// Everything the backward pass needs from a forward pass
struct ForwardPass {
    patches: Vec<Array2<f64>>,
    conv_linear: Array4<f64>,
    argmax: Array4<usize>,
    pooled_dim: (usize, usize, usize, usize),
    hidden: Vec<Array2<f64>>,
    hidden_linear: Vec<Array2<f64>>,
}

impl ForwardPass {
    fn scores(&self) -> &Array2<f64> {
        self.hidden.last().expect("hidden always holds the input")
    }
}

struct Gradients {
    kernels: Array2<f64>,
    conv_bias: Array1<f64>,
    dense: LayerGrads,
}

impl ConvNet {
    pub fn new<R: Rng + ?Sized>(
        architecture: &Architecture,
        training: TrainingConfig,
        rng: &mut R,
    ) -> Result<ConvNet> {
        let (rows, cols) = architecture.input_shape;
        if architecture.kernel_size == 0 || architecture.kernel_size > rows.min(cols) {
            return Err(Error::InvalidParameter(format!(
                "kernel size {} does not fit a {}x{} input",
                architecture.kernel_size, rows, cols
            )));
        }
        if architecture.conv_channels == 0 || architecture.num_classes == 0 {
            return Err(Error::InvalidParameter(
                "conv channels and classes must be positive".to_string(),
            ));
        }

        let conv = Conv2D::new(1, architecture.conv_channels, architecture.kernel_size, rng);
        let pool = MaxPool2D::new(architecture.pool_size.max(1));
        let (conv_rows, conv_cols) = conv.output_shape(rows, cols);
        let (pooled_rows, pooled_cols) = pool.output_shape(conv_rows, conv_cols);
        let flat = architecture.conv_channels * pooled_rows * pooled_cols;
        if flat == 0 {
            return Err(Error::InvalidParameter(format!(
                "pool size {} leaves nothing of the {}x{} feature maps",
                architecture.pool_size, conv_rows, conv_cols
            )));
        }

        let mut structure = vec![flat];
        structure.extend(architecture.hidden.iter().copied().filter(|&n| n > 0));
        structure.push(architecture.num_classes);
        let head = NeuralNet::new(
            &structure,
            architecture.activation_function,
            architecture.init_method,
            rng,
        );

        tracing::debug!(?structure, conv_rows, conv_cols, "built conv net");

        Ok(ConvNet {
            input_shape: (rows, cols),
            conv,
            pool,
            head,
            training,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.head.output_size()
    }

    fn forward(&self, inputs: &ArrayView4<f64>) -> ForwardPass {
        let act = self.head.activation_function;

        let (conv_linear, patches) = self.conv.forward(inputs);
        let activated = conv_linear.mapv(|z| activation(act, z));
        let (pooled, argmax) = self.pool.forward(&activated.view());

        let pooled_dim = pooled.dim();
        let (batch_size, channels, rows, cols) = pooled_dim;
        let flat = pooled
            .into_shape((batch_size, channels * rows * cols))
            .expect("pooled maps flatten into one row per sample");
        let (hidden, hidden_linear) = self.head.forward(&flat.view());

        ForwardPass {
            patches,
            conv_linear,
            argmax,
            pooled_dim,
            hidden,
            hidden_linear,
        }
    }

    /// `grad` is the loss gradient w.r.t. the output scores
    fn backward(&self, pass: &ForwardPass, grad: Array2<f64>) -> Gradients {
        let act = self.head.activation_function;

        let (dense, d_flat) = self.head.backward(&pass.hidden, &pass.hidden_linear, grad);
        let d_pooled = Array4::from_shape_vec(pass.pooled_dim, d_flat.iter().copied().collect())
            .expect("flat gradient matches the pooled shape");

        let (_, _, conv_rows, conv_cols) = pass.conv_linear.dim();
        let mut d_conv = self
            .pool
            .backward(&pass.argmax, &d_pooled.view(), (conv_rows, conv_cols));
        Zip::from(&mut d_conv)
            .and(&pass.conv_linear)
            .for_each(|d, &z| *d *= delta_activation(act, z));

        let (kernels, conv_bias) = self.conv.backward(&pass.patches, &d_conv.view());

        Gradients {
            kernels,
            conv_bias,
            dense,
        }
    }

    fn apply(&mut self, grads: Gradients, optimizer: &mut dyn Optimizer) {
        optimizer.begin_step();
        optimizer.update(
            0,
            self.conv.kernels.view_mut().into_dyn(),
            grads.kernels.view().into_dyn(),
        );
        optimizer.update(
            1,
            self.conv.bias.view_mut().into_dyn(),
            grads.conv_bias.view().into_dyn(),
        );

        for (i, ((weights, bias), (d_weights, d_bias))) in
            self.head.layers.iter_mut().zip(&grads.dense).enumerate()
        {
            optimizer.update(2 + 2 * i, weights.view_mut().into_dyn(), d_weights.view().into_dyn());
            optimizer.update(3 + 2 * i, bias.view_mut().into_dyn(), d_bias.view().into_dyn());
        }
    }

    /// Images must match the input shape and labels must name one of the output classes
    fn check_dataset(&self, dataset: &Dataset, role: &str) -> Result<()> {
        if dataset.image_shape() != self.input_shape {
            return Err(Error::InvalidParameter(format!(
                "{role} images are {:?}, the network expects {:?}",
                dataset.image_shape(),
                self.input_shape
            )));
        }

        let num_classes = self.num_classes();
        if let Some((index, label)) = dataset
            .labels
            .iter()
            .enumerate()
            .find(|(_, &label)| label as usize >= num_classes)
        {
            return Err(Error::InvalidParameter(format!(
                "{role} label {label} at index {index} is not one of {num_classes} classes"
            )));
        }

        Ok(())
    }

    /// Mean loss and accuracy over a whole dataset
    pub fn loss_and_accuracy(&self, dataset: &Dataset) -> (f64, f64) {
        if dataset.is_empty() {
            return (0f64, 0f64);
        }

        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut loss_sum = 0f64;
        let mut correct = 0;

        for batch in indices.chunks(self.training.batch_size.max(1)) {
            let probabilities = self.predict(&dataset.features(batch).view());
            let labels = dataset.labels_at(batch);
            loss_sum += cross_entropy(&probabilities.view(), &labels) * batch.len() as f64;
            correct += count_correct(&probabilities, &labels);
        }

        let n = dataset.len() as f64;
        (loss_sum / n, correct as f64 / n)
    }
}

fn count_correct(probabilities: &Array2<f64>, labels: &[u8]) -> usize {
    probabilities
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, &label)| neural_net::argmax(row.view()) == label as usize)
        .count()
}

impl Model for ConvNet {
    /// Mini-batch training with a fresh shuffle every epoch.
    /// Validation loss and accuracy are computed after each epoch when a validation set is given.
    fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        sink: &mut dyn MetricsSink,
    ) -> Result<Vec<EpochMetrics>> {
        self.check_dataset(train, "training")?;
        if let Some(validation) = validation {
            self.check_dataset(validation, "validation")?;
        }

        let mut rng = match self.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut optimizer = optim::build(self.training.optimizer, self.training.learning_rate);
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut history = Vec::with_capacity(self.training.num_epochs);

        for epoch in 1..=self.training.num_epochs {
            indices.shuffle(&mut rng);

            let mut loss_sum = 0f64;
            let mut correct = 0;

            for batch in indices.chunks(self.training.batch_size.max(1)) {
                let inputs = train.features(batch);
                let labels = train.labels_at(batch);

                let pass = self.forward(&inputs.view());
                let probabilities = softmax(&pass.scores().view());
                loss_sum += cross_entropy(&probabilities.view(), &labels) * batch.len() as f64;
                correct += count_correct(&probabilities, &labels);

                let grads = self.backward(&pass, cross_entropy_grad(probabilities, &labels));
                self.apply(grads, optimizer.as_mut());
            }

            let n = train.len().max(1) as f64;
            let (val_loss, val_accuracy) = match validation {
                Some(validation) if !validation.is_empty() => {
                    let (loss, accuracy) = self.loss_and_accuracy(validation);
                    (Some(loss), Some(accuracy))
                }
                _ => (None, None),
            };

            let metrics = EpochMetrics {
                epoch,
                loss: loss_sum / n,
                accuracy: correct as f64 / n,
                val_loss,
                val_accuracy,
            };
            sink.record(&metrics)?;
            history.push(metrics);
        }

        Ok(history)
    }

    fn predict(&self, inputs: &ArrayView4<f64>) -> Array2<f64> {
        let pass = self.forward(inputs);
        softmax(&pass.scores().view())
    }
}
