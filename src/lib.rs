#![deny(missing_docs)]
//! # bprmf
//!
//! `bprmf` trains latent-factor recommenders with a pairwise ranking loss
//! and evaluates them with top-K ranking metrics (precision, recall, NDCG,
//! F1 and MAP), keeping the best model according to recall at the
//! smallest cutoff.
//!
//! ## Example
//!
//! ```rust,no_run
//! # extern crate bprmf;
//! let data = bprmf::data::Dataset::from_adjacency_dir("data/amazon-book").unwrap();
//!
//! let mut model = bprmf::models::factorization::Hyperparameters::new(
//!     data.num_users(),
//!     data.num_items(),
//! ).latent_dim(64)
//!     .learning_rate(0.0001)
//!     .l2_penalty(1e-5)
//!     .from_seed(2019)
//!     .build();
//!
//! let config = bprmf::training::TrainingConfig::default()
//!     .ks(vec![20, 40, 60, 80, 100])
//!     .num_epochs(100)
//!     .evaluate_every(10)
//!     .validate()
//!     .unwrap();
//!
//! let mut store = bprmf::persistence::MemoryStore::default();
//! let outcome = bprmf::training::fit(&mut model, &data, &config, &mut store).unwrap();
//!
//! if let Some(best) = outcome.best {
//!     println!("Best epoch {} with recall {}", best.epoch, best.recall);
//! }
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
extern crate csv;
extern crate ndarray;
extern crate rand;
extern crate rayon;
extern crate serde;
extern crate serde_json;

#[cfg(feature = "download")]
extern crate reqwest;

#[cfg(test)]
extern crate proptest;
#[cfg(test)]
extern crate tempfile;

pub mod data;
#[cfg(feature = "download")]
pub mod datasets;
pub mod early_stopping;
pub mod evaluation;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod sampling;
pub mod training;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;
/// Alias for timestamps.
pub type Timestamp = usize;

/// Dense `(user, item)` score table. Row `r` holds the scores of the
/// `r`-th requested user for every requested item, in request order.
pub type ScoreMatrix = ndarray::Array2<f32>;

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The user is outside of the model's id space.
    #[fail(display = "Unknown user id {}.", _0)]
    UnknownUser(UserId),
    /// The item is outside of the model's id space.
    #[fail(display = "Unknown item id {}.", _0)]
    UnknownItem(ItemId),
    /// The scores returned do not cover the requested users and items.
    #[fail(display = "Expected {} by {} scores, got {} by {}.", _0, _1, _2, _3)]
    ScoreShape(usize, usize, usize, usize),
}

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "Unable to fit the model: no interactions.")]
    NoInteractions,
    /// The training configuration was rejected before training started.
    #[fail(display = "Invalid configuration: {}", _0)]
    InvalidConfiguration(#[cause] training::ConfigError),
    /// The loss diverged. Training cannot recover from this.
    #[fail(
        display = "Loss is {} at epoch {} iteration {}.",
        loss,
        epoch,
        iteration
    )]
    NonFiniteLoss {
        /// Epoch (1-indexed) of the offending batch.
        epoch: usize,
        /// Iteration (1-indexed) within the epoch.
        iteration: usize,
        /// The offending loss value.
        loss: f32,
    },
    /// Scoring failed during evaluation.
    #[fail(display = "Evaluation failed: {}", _0)]
    Prediction(#[cause] PredictionError),
    /// The metrics table could not be written.
    #[fail(display = "Unable to persist training results: {}", _0)]
    Persistence(failure::Error),
}

impl From<PredictionError> for FittingError {
    fn from(error: PredictionError) -> Self {
        FittingError::Prediction(error)
    }
}

impl From<training::ConfigError> for FittingError {
    fn from(error: training::ConfigError) -> Self {
        FittingError::InvalidConfiguration(error)
    }
}

/// Models that can score arbitrary `(user, item)` combinations.
pub trait Scorer {
    /// Number of users in the model's id space.
    fn num_users(&self) -> usize;
    /// Number of items in the model's id space.
    fn num_items(&self) -> usize;
    /// Score every item in `item_ids` for every user in `user_ids`.
    ///
    /// Scores are raw relevance values: they are neither clipped
    /// nor normalised.
    fn predict(&self, user_ids: &[UserId], item_ids: &[ItemId])
        -> Result<ScoreMatrix, PredictionError>;
}

/// Models trained by pairwise ranking over `(user, positive, negative)` triples.
///
/// Training is split into computing the loss for a batch and applying the
/// optimizer step for that same batch, so that callers can inspect the loss
/// before the parameters change.
pub trait PairwiseModel: Scorer {
    /// Serializable copy of the model's parameters.
    type Snapshot: Clone + serde::Serialize;
    /// Compute the mean pairwise loss of a batch of triples.
    fn batch_loss(
        &mut self,
        user_ids: &[UserId],
        positive_item_ids: &[ItemId],
        negative_item_ids: &[ItemId],
    ) -> Result<f32, FittingError>;
    /// Backpropagate the last computed batch loss and update the parameters.
    fn step(&mut self);
    /// Copy the current parameters.
    fn snapshot(&self) -> Self::Snapshot;
    /// Replace the current parameters.
    fn restore(&mut self, snapshot: &Self::Snapshot);
}
