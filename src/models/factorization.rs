//! Matrix factorization trained with a pairwise ranking loss.
//!
//! The model estimates three sets of parameters:
//!
//! - n-dimensional user embeddings,
//! - n-dimensional item embeddings, and
//! - item biases (capturing item popularity).
//!
//! The score of item `i` for user `u` is given by
//! ```text
//! score(u, i) = <e_u, e_i> + b_i
//! ```
//! and the parameters are fitted on `(user, positive, negative)` triples,
//! pushing the score of the observed item above that of the sampled one.
use failure;
use ndarray::{Array2, Axis};
use rand;
use rand::distributions::{Distribution, Normal};
use rand::{Rng, SeedableRng, XorShiftRng};

use super::{optim, Loss, Optimizer};
use sampling::seeded_rng;
use {FittingError, ItemId, PairwiseModel, PredictionError, ScoreMatrix, Scorer, UserId};

fn embedding_init<T: Rng>(rows: usize, cols: usize, rng: &mut T) -> Array2<f32> {
    let normal = Normal::new(0.0, 1.0 / cols as f64);
    Array2::<f32>::zeros((rows, cols)).map(|_| normal.sample(rng) as f32)
}

/// Value of the pairwise loss at `difference = positive - negative`,
/// and its derivative with respect to `difference`.
fn pairwise_loss(loss: Loss, difference: f32) -> (f32, f32) {
    if difference.is_nan() {
        return (difference, 0.0);
    }

    match loss {
        Loss::BPR => {
            // -ln sigmoid(x) = ln(1 + exp(-x)), evaluated without overflow.
            let value = if difference > 0.0 {
                (-difference).exp().ln_1p()
            } else {
                -difference + difference.exp().ln_1p()
            };
            let derivative = -1.0 / (1.0 + difference.exp());

            (value, derivative)
        }
        Loss::Hinge => {
            let margin = 1.0 - difference;

            if margin > 0.0 {
                (margin, -1.0)
            } else {
                (0.0, 0.0)
            }
        }
    }
}

/// Hyperparameters describing the factorization model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_users: usize,
    num_items: usize,
    latent_dim: usize,
    learning_rate: f32,
    l2_penalty: f32,
    loss: Loss,
    optimizer: Optimizer,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Hyperparameters {
            num_users: num_users,
            num_items: num_items,
            latent_dim: 64,
            learning_rate: 0.0001,
            l2_penalty: 1e-5,
            loss: Loss::BPR,
            optimizer: Optimizer::Adam,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Set the embedding dimensionality.
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Set the loss function.
    pub fn loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    /// Set the optimizer type.
    pub fn optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: u64) -> Self {
        self.rng = seeded_rng(seed, 0);
        self
    }

    /// Number of users the model is built for.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items the model is built for.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    fn build_state(&mut self) -> FactorizationState {
        let user_embedding = embedding_init(self.num_users, self.latent_dim, &mut self.rng);
        let item_embedding = embedding_init(self.num_items, self.latent_dim, &mut self.rng);

        FactorizationState {
            user_embedding: user_embedding,
            item_embedding: item_embedding,
            item_biases: Array2::zeros((self.num_items, 1)),
        }
    }

    /// Build the implicit factorization model.
    pub fn build(mut self) -> ImplicitFactorizationModel {
        let state = self.build_state();
        ImplicitFactorizationModel::with_state(self, state)
    }
}

/// The trainable parameters of an [`ImplicitFactorizationModel`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorizationState {
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    item_biases: Array2<f32>,
}

impl FactorizationState {
    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.user_embedding.nrows()
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.item_embedding.nrows()
    }

    /// Embedding dimensionality.
    pub fn latent_dim(&self) -> usize {
        self.item_embedding.ncols()
    }

    /// User embeddings, one row per user.
    pub fn user_embedding(&self) -> &Array2<f32> {
        &self.user_embedding
    }

    /// Item embeddings, one row per item.
    pub fn item_embedding(&self) -> &Array2<f32> {
        &self.item_embedding
    }

    /// Item biases, one row per item.
    pub fn item_biases(&self) -> &Array2<f32> {
        &self.item_biases
    }
}

struct Gradients {
    user_embedding: Array2<f32>,
    item_embedding: Array2<f32>,
    item_biases: Array2<f32>,
    pending: bool,
}

impl Gradients {
    fn zeros_like(state: &FactorizationState) -> Self {
        Gradients {
            user_embedding: Array2::zeros(state.user_embedding.dim()),
            item_embedding: Array2::zeros(state.item_embedding.dim()),
            item_biases: Array2::zeros(state.item_biases.dim()),
            pending: false,
        }
    }

    fn clear(&mut self) {
        self.user_embedding.fill(0.0);
        self.item_embedding.fill(0.0);
        self.item_biases.fill(0.0);
        self.pending = false;
    }
}

/// Matrix factorization model for implicit feedback.
pub struct ImplicitFactorizationModel {
    hyper: Hyperparameters,
    state: FactorizationState,
    gradients: Gradients,
    user_optimizer: Box<dyn optim::Optimizer>,
    item_optimizer: Box<dyn optim::Optimizer>,
    bias_optimizer: Box<dyn optim::Optimizer>,
}

impl ImplicitFactorizationModel {
    fn with_state(hyper: Hyperparameters, state: FactorizationState) -> Self {
        let gradients = Gradients::zeros_like(&state);

        ImplicitFactorizationModel {
            user_optimizer: hyper.optimizer.build(hyper.learning_rate),
            item_optimizer: hyper.optimizer.build(hyper.learning_rate),
            bias_optimizer: hyper.optimizer.build(hyper.learning_rate),
            hyper: hyper,
            state: state,
            gradients: gradients,
        }
    }

    /// Rebuild a model from previously saved parameters.
    ///
    /// Fails if the parameters do not match the shape described by `hyper`.
    pub fn from_state(
        hyper: Hyperparameters,
        state: FactorizationState,
    ) -> Result<Self, failure::Error> {
        if state.num_users() != hyper.num_users || state.num_items() != hyper.num_items {
            bail!(
                "Saved parameters cover {} users and {} items, expected {} and {}.",
                state.num_users(),
                state.num_items(),
                hyper.num_users,
                hyper.num_items
            );
        }

        if state.user_embedding.ncols() != state.latent_dim()
            || state.item_biases.dim() != (state.num_items(), 1)
        {
            bail!("Saved parameters have inconsistent shapes.");
        }

        let latent_dim = state.latent_dim();

        Ok(Self::with_state(hyper.latent_dim(latent_dim), state))
    }

    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// The current parameters.
    pub fn state(&self) -> &FactorizationState {
        &self.state
    }

    fn check_users(&self, user_ids: &[UserId]) -> Result<(), PredictionError> {
        match user_ids.iter().find(|&&user_id| user_id >= self.num_users()) {
            Some(&user_id) => Err(PredictionError::UnknownUser(user_id)),
            None => Ok(()),
        }
    }

    fn check_items(&self, item_ids: &[ItemId]) -> Result<(), PredictionError> {
        match item_ids.iter().find(|&&item_id| item_id >= self.num_items()) {
            Some(&item_id) => Err(PredictionError::UnknownItem(item_id)),
            None => Ok(()),
        }
    }
}

impl Scorer for ImplicitFactorizationModel {
    fn num_users(&self) -> usize {
        self.state.num_users()
    }

    fn num_items(&self) -> usize {
        self.state.num_items()
    }

    fn predict(
        &self,
        user_ids: &[UserId],
        item_ids: &[ItemId],
    ) -> Result<ScoreMatrix, PredictionError> {
        self.check_users(user_ids)?;
        self.check_items(item_ids)?;

        let users = self.state.user_embedding.select(Axis(0), user_ids);
        let items = self.state.item_embedding.select(Axis(0), item_ids);
        let biases = self.state.item_biases.select(Axis(0), item_ids);

        let mut scores = users.dot(&items.t());
        scores += &biases.t();

        if scores.iter().any(|score| !score.is_finite()) {
            return Err(PredictionError::InvalidPredictionValue);
        }

        Ok(scores)
    }
}

impl PairwiseModel for ImplicitFactorizationModel {
    type Snapshot = FactorizationState;

    fn batch_loss(
        &mut self,
        user_ids: &[UserId],
        positive_item_ids: &[ItemId],
        negative_item_ids: &[ItemId],
    ) -> Result<f32, FittingError> {
        self.check_users(user_ids)?;
        self.check_items(positive_item_ids)?;
        self.check_items(negative_item_ids)?;
        debug_assert_eq!(user_ids.len(), positive_item_ids.len());
        debug_assert_eq!(user_ids.len(), negative_item_ids.len());

        self.gradients.clear();

        if user_ids.is_empty() {
            return Ok(0.0);
        }

        let num_triples = user_ids.len() as f32;
        let l2_penalty = self.hyper.l2_penalty;
        let decay = l2_penalty / num_triples;
        let loss = self.hyper.loss;

        let state = &self.state;
        let gradients = &mut self.gradients;
        let mut total_loss = 0.0;

        for (&user_id, &positive_id, &negative_id) in
            izip!(user_ids, positive_item_ids, negative_item_ids)
        {
            let user = state.user_embedding.row(user_id);
            let positive = state.item_embedding.row(positive_id);
            let negative = state.item_embedding.row(negative_id);

            let difference = user.dot(&positive) - user.dot(&negative)
                + state.item_biases[(positive_id, 0)]
                - state.item_biases[(negative_id, 0)];

            let (value, derivative) = pairwise_loss(loss, difference);
            let penalty = 0.5 * (user.dot(&user) + positive.dot(&positive) + negative.dot(&negative));

            total_loss += value + l2_penalty * penalty;

            let grad = derivative / num_triples;

            {
                let mut user_grad = gradients.user_embedding.row_mut(user_id);
                user_grad.scaled_add(grad, &positive);
                user_grad.scaled_add(-grad, &negative);
                user_grad.scaled_add(decay, &user);
            }
            {
                let mut positive_grad = gradients.item_embedding.row_mut(positive_id);
                positive_grad.scaled_add(grad, &user);
                positive_grad.scaled_add(decay, &positive);
            }
            {
                let mut negative_grad = gradients.item_embedding.row_mut(negative_id);
                negative_grad.scaled_add(-grad, &user);
                negative_grad.scaled_add(decay, &negative);
            }

            gradients.item_biases[(positive_id, 0)] += grad;
            gradients.item_biases[(negative_id, 0)] -= grad;
        }

        gradients.pending = true;

        Ok(total_loss / num_triples)
    }

    fn step(&mut self) {
        if !self.gradients.pending {
            return;
        }

        self.user_optimizer
            .update_params(&mut self.state.user_embedding, &self.gradients.user_embedding);
        self.item_optimizer
            .update_params(&mut self.state.item_embedding, &self.gradients.item_embedding);
        self.bias_optimizer
            .update_params(&mut self.state.item_biases, &self.gradients.item_biases);

        self.gradients.pending = false;
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.state.clone()
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) {
        self.state = snapshot.clone();
        self.gradients = Gradients::zeros_like(&self.state);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    fn model(users: Array2<f32>, items: Array2<f32>, biases: Array2<f32>) -> ImplicitFactorizationModel {
        let hyper = Hyperparameters::new(users.nrows(), items.nrows())
            .l2_penalty(0.0)
            .optimizer(Optimizer::SGD)
            .learning_rate(0.1);

        ImplicitFactorizationModel::from_state(
            hyper,
            FactorizationState {
                user_embedding: users,
                item_embedding: items,
                item_biases: biases,
            },
        ).unwrap()
    }

    fn small_model() -> ImplicitFactorizationModel {
        model(
            arr2(&[[0.1, 0.4], [-0.3, 0.2]]),
            arr2(&[[0.5, -0.2], [0.3, 0.3], [-0.1, 0.6]]),
            arr2(&[[0.1], [0.0], [-0.2]]),
        )
    }

    #[test]
    fn predictions_are_dot_products_plus_bias() {
        let model = small_model();

        let scores = model.predict(&[1, 0], &[2, 0]).unwrap();

        assert_eq!(scores.dim(), (2, 2));
        assert!((scores[(0, 0)] - (0.03 + 0.12 - 0.2)).abs() < 1e-6);
        assert!((scores[(0, 1)] - (-0.15 - 0.04 + 0.1)).abs() < 1e-6);
        assert!((scores[(1, 0)] - (-0.01 + 0.24 - 0.2)).abs() < 1e-6);
        assert!((scores[(1, 1)] - (0.05 - 0.08 + 0.1)).abs() < 1e-6);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let model = small_model();

        match model.predict(&[2], &[0]) {
            Err(PredictionError::UnknownUser(2)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
        match model.predict(&[0], &[0, 3]) {
            Err(PredictionError::UnknownItem(3)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn non_finite_parameters_are_reported() {
        let mut model = small_model();
        model.state.user_embedding[(0, 0)] = ::std::f32::NAN;

        match model.predict(&[0], &[0]) {
            Err(PredictionError::InvalidPredictionValue) => {}
            other => panic!("Unexpected result {:?}", other),
        }

        assert!(model.batch_loss(&[0], &[0], &[1]).unwrap().is_nan());
    }

    #[test]
    fn bpr_loss_is_stable() {
        let (at_zero, derivative) = pairwise_loss(Loss::BPR, 0.0);
        assert!((at_zero - 2.0f32.ln()).abs() < 1e-6);
        assert!((derivative + 0.5).abs() < 1e-6);

        let (large_negative, _) = pairwise_loss(Loss::BPR, -100.0);
        assert!((large_negative - 100.0).abs() < 1e-3);

        let (large_positive, derivative) = pairwise_loss(Loss::BPR, 100.0);
        assert!(large_positive >= 0.0 && large_positive < 1e-6);
        assert!(derivative.abs() < 1e-6);
    }

    #[test]
    fn hinge_loss() {
        assert_eq!(pairwise_loss(Loss::Hinge, 0.25), (0.75, -1.0));
        assert_eq!(pairwise_loss(Loss::Hinge, 1.5), (0.0, 0.0));
        assert!(pairwise_loss(Loss::Hinge, ::std::f32::NAN).0.is_nan());
    }

    #[derive(Clone, Copy)]
    enum Parameter {
        User,
        Item,
        Bias,
    }

    const USERS: [UserId; 3] = [0, 1, 0];
    const POSITIVES: [ItemId; 3] = [0, 2, 2];
    const NEGATIVES: [ItemId; 3] = [1, 0, 1];

    fn parameter(state: &mut FactorizationState, which: Parameter) -> &mut Array2<f32> {
        match which {
            Parameter::User => &mut state.user_embedding,
            Parameter::Item => &mut state.item_embedding,
            Parameter::Bias => &mut state.item_biases,
        }
    }

    fn numeric_gradient(
        model: &mut ImplicitFactorizationModel,
        which: Parameter,
        idx: (usize, usize),
    ) -> f32 {
        let epsilon = 1e-3;
        let original = parameter(&mut model.state, which)[idx];

        parameter(&mut model.state, which)[idx] = original + epsilon;
        let upper = model.batch_loss(&USERS, &POSITIVES, &NEGATIVES).unwrap();
        parameter(&mut model.state, which)[idx] = original - epsilon;
        let lower = model.batch_loss(&USERS, &POSITIVES, &NEGATIVES).unwrap();
        parameter(&mut model.state, which)[idx] = original;

        (upper - lower) / (2.0 * epsilon)
    }

    fn check_gradients(loss: Loss, l2_penalty: f32) {
        let mut model = small_model();
        model.hyper = model.hyper.clone().loss(loss).l2_penalty(l2_penalty);
        model.batch_loss(&USERS, &POSITIVES, &NEGATIVES).unwrap();

        let analytic = vec![
            (Parameter::User, model.gradients.user_embedding.clone()),
            (Parameter::Item, model.gradients.item_embedding.clone()),
            (Parameter::Bias, model.gradients.item_biases.clone()),
        ];

        for (which, gradient) in analytic {
            for (idx, &expected) in gradient.indexed_iter() {
                let numeric = numeric_gradient(&mut model, which, idx);
                assert!(
                    (numeric - expected).abs() < 1e-2,
                    "{:?}: numeric {} analytic {}",
                    idx,
                    numeric,
                    expected
                );
            }
        }
    }

    #[test]
    fn bpr_gradients_match_finite_differences() {
        check_gradients(Loss::BPR, 0.0);
        check_gradients(Loss::BPR, 0.1);
    }

    #[test]
    fn hinge_gradients_match_finite_differences() {
        check_gradients(Loss::Hinge, 0.0);
        check_gradients(Loss::Hinge, 0.1);
    }

    #[test]
    fn step_without_loss_is_a_no_op() {
        let mut model = small_model();
        let before = model.snapshot();

        model.step();
        assert_eq!(model.snapshot(), before);

        model.batch_loss(&[], &[], &[]).unwrap();
        model.step();
        assert_eq!(model.snapshot(), before);
    }

    #[test]
    fn training_separates_positives_from_negatives() {
        for &optimizer in &[Optimizer::SGD, Optimizer::Adagrad, Optimizer::Adam] {
            for &loss in &[Loss::BPR, Loss::Hinge] {
                let mut model = Hyperparameters::new(2, 4)
                    .latent_dim(8)
                    .learning_rate(0.05)
                    .l2_penalty(1e-4)
                    .loss(loss)
                    .optimizer(optimizer)
                    .from_seed(42)
                    .build();

                let (users, positives, negatives) = ([0, 0, 1, 1], [0, 1, 2, 3], [2, 3, 0, 1]);

                let initial = model.batch_loss(&users, &positives, &negatives).unwrap();
                model.step();

                let mut last = initial;
                for _ in 0..500 {
                    last = model.batch_loss(&users, &positives, &negatives).unwrap();
                    model.step();
                }

                assert!(last < initial, "{:?}/{:?}: {} >= {}", optimizer, loss, last, initial);

                let scores = model.predict(&[0, 1], &[0, 1, 2, 3]).unwrap();
                assert!(scores[(0, 0)] > scores[(0, 2)]);
                assert!(scores[(1, 3)] > scores[(1, 1)]);
            }
        }
    }

    #[test]
    fn restore_brings_back_predictions() {
        let mut model = Hyperparameters::new(3, 5).latent_dim(4).from_seed(1).build();
        let snapshot = model.snapshot();
        let before = model.predict(&[0, 1, 2], &[0, 1, 2, 3, 4]).unwrap();

        for _ in 0..10 {
            model.batch_loss(&[0, 1, 2], &[0, 1, 2], &[4, 3, 3]).unwrap();
            model.step();
        }
        assert_ne!(model.predict(&[0, 1, 2], &[0, 1, 2, 3, 4]).unwrap(), before);

        model.restore(&snapshot);
        assert_eq!(model.predict(&[0, 1, 2], &[0, 1, 2, 3, 4]).unwrap(), before);
    }

    #[test]
    fn seeded_models_are_identical() {
        let first = Hyperparameters::new(4, 6).latent_dim(3).from_seed(7).build();
        let second = Hyperparameters::new(4, 6).latent_dim(3).from_seed(7).build();

        assert_eq!(first.state(), second.state());
        assert_eq!(first.state().latent_dim(), 3);
        assert_eq!(first.state().item_biases().dim(), (6, 1));
    }

    #[test]
    fn state_shape_is_checked() {
        let state = Hyperparameters::new(4, 6).latent_dim(3).build().snapshot();

        assert!(ImplicitFactorizationModel::from_state(Hyperparameters::new(4, 6), state.clone()).is_ok());
        assert!(ImplicitFactorizationModel::from_state(Hyperparameters::new(5, 6), state).is_err());
    }
}
