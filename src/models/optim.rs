//! First-order optimizers over dense parameter arrays.
use ndarray::{Array2, Zip};

/// Update rule applied to one parameter array given its gradient.
pub trait Optimizer: Send + Sync {
    /// Take one step against `grad`.
    fn update_params(&mut self, params: &mut Array2<f32>, grad: &Array2<f32>);
}

/// Plain gradient descent.
#[derive(Clone, Debug)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    /// Build a new SGD optimizer.
    pub fn new(learning_rate: f32) -> Self {
        Sgd { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn update_params(&mut self, params: &mut Array2<f32>, grad: &Array2<f32>) {
        params.scaled_add(-self.learning_rate, grad);
    }
}

/// Adagrad: per-coordinate learning rates scaled by the accumulated
/// squared gradients.
#[derive(Clone, Debug)]
pub struct Adagrad {
    learning_rate: f32,
    epsilon: f32,
    accumulators: Option<Array2<f32>>,
}

impl Adagrad {
    /// Build a new Adagrad optimizer.
    pub fn new(learning_rate: f32) -> Self {
        Adagrad {
            learning_rate,
            epsilon: 1e-8,
            accumulators: None,
        }
    }
}

impl Optimizer for Adagrad {
    fn update_params(&mut self, params: &mut Array2<f32>, grad: &Array2<f32>) {
        let lr = self.learning_rate;
        let eps = self.epsilon;
        let accumulators = self
            .accumulators
            .get_or_insert_with(|| Array2::zeros(params.dim()));

        Zip::from(params)
            .and(grad)
            .and(accumulators)
            .for_each(|p, &g, acc| {
                *acc += g * g;
                *p -= lr * g / (acc.sqrt() + eps);
            });
    }
}

/// Adam with bias correction.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    v: Option<Array2<f32>>,
    s: Option<Array2<f32>>,
}

impl Adam {
    /// Build a new Adam optimizer with the usual moment decay rates.
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            beta1_t: 1.0,
            beta2_t: 1.0,
            epsilon: 1e-8,
            v: None,
            s: None,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut Array2<f32>, grad: &Array2<f32>) {
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1.0 - self.beta1_t;
        let bc2 = 1.0 - self.beta2_t;
        let step_size = self.learning_rate * (bc2.sqrt() / bc1);

        let dim = params.dim();
        let v = self.v.get_or_insert_with(|| Array2::zeros(dim));
        let s = self.s.get_or_insert_with(|| Array2::zeros(dim));

        Zip::from(params)
            .and(grad)
            .and(v)
            .and(s)
            .for_each(|p, &g, v, s| {
                *v = b1 * *v + (1.0 - b1) * g;
                *s = b2 * *s + (1.0 - b2) * g * g;
                *p -= step_size * *v / (s.sqrt() + eps);
            });
    }
}
