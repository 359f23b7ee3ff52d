//! Models module.
pub mod factorization;
pub mod optim;

/// The loss used for training the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Loss {
    /// Bayesian Personalised Ranking: `-ln sigmoid(positive - negative)`.
    BPR,
    /// Pairwise hinge loss: `max(0, 1 - positive + negative)`.
    Hinge,
}

/// Optimizer user to train the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Optimizer {
    /// Plain stochastic gradient descent.
    SGD,
    /// Adagrad.
    Adagrad,
    /// Adam.
    Adam,
}

impl Optimizer {
    /// Instantiate the update rule for one parameter array.
    pub fn build(&self, learning_rate: f32) -> Box<dyn optim::Optimizer> {
        match *self {
            Optimizer::SGD => Box::new(optim::Sgd::new(learning_rate)),
            Optimizer::Adagrad => Box::new(optim::Adagrad::new(learning_rate)),
            Optimizer::Adam => Box::new(optim::Adam::new(learning_rate)),
        }
    }
}
