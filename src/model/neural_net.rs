use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Gradients of a dense stack, one (weights, bias) pair per layer
pub type LayerGrads = Vec<(Array2<f64>, Array1<f64>)>;

/// Fully connected layers, used as the classifier head of the conv net
#[derive(Debug, Clone)]
pub struct NeuralNet {
    pub layers: Vec<(Array2<f64>, Array1<f64>)>, // Each layer holds a weight matrix [in, out] and a bias vector [out]
    pub activation_function: ActivationFunction,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationFunction {
    #[value(name = "relu")]
    ReLU,
    Sigmoid,
    Tanh,
    #[value(name = "leaky-relu")]
    LeakyReLU,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMethod {
    Default,
    Xavier,
}

impl NeuralNet {
    /// Construct a dense stack, e.g. [1152, 128, 26]
    pub fn new<R: Rng + ?Sized>(
        layer_structure: &[usize],
        activation_function: ActivationFunction,
        init_method: InitMethod,
        rng: &mut R,
    ) -> NeuralNet {
        let layers = match init_method {
            InitMethod::Default => init_layers_default(layer_structure, rng),
            InitMethod::Xavier => init_layers_xavier(layer_structure, rng),
        };

        NeuralNet {
            layers,
            activation_function,
        }
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, |(w, _)| w.ncols())
    }

    // Perform a forward pass of the network on some input.
    // Returns the outputs of the layers (starting with the input itself), and the non-activated outputs (used for backprop)
    pub fn forward(&self, inputs: &ArrayView2<f64>) -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
        let mut hidden = vec![inputs.to_owned()];
        let mut hidden_linear = vec![];

        let mut it = self.layers.iter().peekable();

        while let Some(layer) = it.next() {
            let previous = hidden.last().expect("hidden always holds the input");
            let lin_output = previous.dot(&layer.0) + &layer.1;
            // Hidden layers are activated, the output layer yields raw scores
            let real_output = match it.peek() {
                Some(_) => lin_output.mapv(|x| activation(self.activation_function, x)),
                None => lin_output.clone(),
            };

            hidden.push(real_output);
            hidden_linear.push(lin_output);
        }

        (hidden, hidden_linear)
    }

    /// Backprop `grad` (loss w.r.t. the output scores) through the stack.
    /// Returns the per-layer gradients and the gradient w.r.t. the input.
    pub fn backward(
        &self,
        hidden: &[Array2<f64>],
        hidden_linear: &[Array2<f64>],
        grad: Array2<f64>,
    ) -> (LayerGrads, Array2<f64>) {
        // The gradient WRT the output of the current layer
        let mut grad_help = grad;
        let mut grads = Vec::with_capacity(self.layers.len());

        for idx in (0..self.layers.len()).rev() {
            if idx != self.layers.len() - 1 {
                let step_mat =
                    hidden_linear[idx].mapv(|x| delta_activation(self.activation_function, x));
                grad_help = grad_help * step_mat;
            }

            let weight_grad = hidden[idx].t().dot(&grad_help);
            let bias_grad = grad_help.sum_axis(Axis(0));

            grad_help = grad_help.dot(&self.layers[idx].0.t());
            grads.push((weight_grad, bias_grad));
        }

        grads.reverse();

        (grads, grad_help)
    }
}

pub fn activation(name: ActivationFunction, z: f64) -> f64 {
    match name {
        ActivationFunction::ReLU => z.max(0f64),
        ActivationFunction::Sigmoid => (1f64 + (-z).exp()).recip(),
        ActivationFunction::Tanh => z.tanh(),
        ActivationFunction::LeakyReLU => z.max(0.01 * z),
    }
}

pub fn delta_activation(name: ActivationFunction, z: f64) -> f64 {
    match name {
        ActivationFunction::ReLU => {
            if z > 0f64 {
                1f64
            } else {
                0f64
            }
        }
        ActivationFunction::Sigmoid => activation(name, z) * (1f64 - activation(name, z)),
        ActivationFunction::Tanh => 1f64 - activation(name, z) * activation(name, z),
        ActivationFunction::LeakyReLU => {
            if z > 0f64 {
                1f64
            } else {
                0.01f64
            }
        }
    }
}

fn init_layers_default<R: Rng + ?Sized>(
    layer_structure: &[usize],
    rng: &mut R,
) -> Vec<(Array2<f64>, Array1<f64>)> {
    let mut layers = vec![];
    // Weights are initialized from a uniform distribiution
    let distribution = Uniform::new(-0.3, 0.3);

    for pair in layer_structure.windows(2) {
        let weights = Array::zeros((pair[0], pair[1])).map(|_: &f64| distribution.sample(&mut *rng));
        let bias = Array::zeros(pair[1]);

        layers.push((weights, bias));
    }

    layers
}

fn init_layers_xavier<R: Rng + ?Sized>(
    layer_structure: &[usize],
    rng: &mut R,
) -> Vec<(Array2<f64>, Array1<f64>)> {
    let mut layers = vec![];

    for pair in layer_structure.windows(2) {
        let boundary = (6f64 / (pair[0] + pair[1]) as f64).sqrt();
        let dist = Uniform::new_inclusive(-boundary, boundary);

        let weights = Array::zeros((pair[0], pair[1])).map(|_: &f64| dist.sample(&mut *rng));
        let bias = Array::zeros(pair[1]);

        layers.push((weights, bias));
    }

    layers
}

/// Row-wise softmax - Convert scores into probability distributions
pub fn softmax(scores: &ArrayView2<f64>) -> Array2<f64> {
    let mut probabilities = scores.to_owned();

    for mut row in probabilities.axis_iter_mut(Axis(0)) {
        // Shift by the max so exp never overflows
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }

    probabilities
}

/// Mean cross-entropy of the true classes under `probabilities`
pub fn cross_entropy(probabilities: &ArrayView2<f64>, labels: &[u8]) -> f64 {
    if labels.is_empty() {
        return 0f64;
    }

    let total: f64 = probabilities
        .axis_iter(Axis(0))
        .zip(labels)
        .map(|(row, &label)| -(row[label as usize] + 1e-12).ln())
        .sum();

    total / labels.len() as f64
}

/// Gradient of the mean softmax cross-entropy w.r.t. the scores
pub fn cross_entropy_grad(probabilities: Array2<f64>, labels: &[u8]) -> Array2<f64> {
    let batch_size = labels.len().max(1) as f64;
    let mut grad = probabilities;

    for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(labels) {
        row[label as usize] -= 1f64;
    }

    grad / batch_size
}

/// Index of the highest score
pub fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(idx, _)| idx)
}
