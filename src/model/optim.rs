use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

pub trait Optimizer {
    /// Called once per mini-batch, before the parameters are updated
    fn begin_step(&mut self);

    /// Update one parameter tensor in place. `slot` identifies the tensor across steps.
    fn update(&mut self, slot: usize, param: ArrayViewMutD<f64>, grad: ArrayViewD<f64>);
}

pub fn build(kind: OptimizerKind, learning_rate: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd => Box::new(Sgd { learning_rate }),
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
    }
}

pub struct Sgd {
    pub learning_rate: f64,
}

impl Optimizer for Sgd {
    fn begin_step(&mut self) {}

    fn update(&mut self, _slot: usize, mut param: ArrayViewMutD<f64>, grad: ArrayViewD<f64>) {
        param.scaled_add(-self.learning_rate, &grad);
    }
}

pub struct Adam {
    pub t: i32,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    moments: Vec<Option<(ArrayD<f64>, ArrayD<f64>)>>, // first and second moment per slot
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam {
            t: 0,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            moments: vec![],
        }
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, slot: usize, param: ArrayViewMutD<f64>, grad: ArrayViewD<f64>) {
        if self.moments.len() <= slot {
            self.moments.resize(slot + 1, None);
        }

        let (beta1, beta2, epsilon, learning_rate) =
            (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let step = self.t.max(1);
        let correction1 = 1f64 - beta1.powi(step);
        let correction2 = 1f64 - beta2.powi(step);

        let (m, v) = self.moments[slot]
            .get_or_insert_with(|| (ArrayD::zeros(grad.raw_dim()), ArrayD::zeros(grad.raw_dim())));

        Zip::from(param)
            .and(m)
            .and(v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1f64 - beta1) * g;
                *v = beta2 * *v + (1f64 - beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
    }
}
