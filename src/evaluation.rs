//! Masked top-K ranking and evaluation passes.
use std::cmp::Ordering;

use ndarray::{self, Axis};
use rayon::prelude::*;

use super::{ItemId, Scorer, ScoreMatrix, UserId};
use data::Dataset;
use metrics::{compute_metrics, MetricAccumulator, MetricsAtK};
use sampling::{sample_evaluation_negatives, seeded_rng};
use PredictionError;

/// Which items a user's ranked list is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateMode {
    /// Every item in the catalogue except the user's training items.
    FullCatalog,
    /// The user's test items plus `num_negatives` items sampled from
    /// those the user has not interacted with.
    SampledNegatives {
        /// Number of sampled negatives per user.
        num_negatives: usize,
    },
}

impl Default for CandidateMode {
    fn default() -> Self {
        CandidateMode::FullCatalog
    }
}

/// Descending score with NaN last, then ascending item id.
fn ranking_order(x: &(ItemId, f32), y: &(ItemId, f32)) -> Ordering {
    let by_score = match (x.1.is_nan(), y.1.is_nan()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => y.1.partial_cmp(&x.1).unwrap_or(Ordering::Equal),
    };

    by_score.then_with(|| x.0.cmp(&y.0))
}

/// Rank scored candidates, best first.
///
/// Items in `excluded` (sorted) never appear in the result. The
/// remaining candidates are sorted by descending score, ties broken by
/// ascending item id, and truncated to `k_max`. Items scored NaN rank
/// below every other candidate.
pub fn rank<I>(scores: I, excluded: &[ItemId], k_max: usize) -> Vec<ItemId>
where
    I: IntoIterator<Item = (ItemId, f32)>,
{
    let mut candidates: Vec<(ItemId, f32)> = scores
        .into_iter()
        .filter(|&(item_id, _)| excluded.binary_search(&item_id).is_err())
        .collect();

    if k_max == 0 {
        return Vec::new();
    }

    if candidates.len() > k_max {
        candidates.select_nth_unstable_by(k_max - 1, ranking_order);
        candidates.truncate(k_max);
    }

    candidates.sort_unstable_by(ranking_order);

    candidates.into_iter().map(|(item_id, _)| item_id).collect()
}

/// Result of one evaluation pass.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Mean metrics over the evaluation population, by cutoff.
    pub metrics: MetricsAtK,
    /// Number of users evaluated.
    pub num_users: usize,
    /// Users in evaluation order; the rows of `scores`.
    pub user_ids: Vec<UserId>,
    /// Scores of every evaluated user for every item, when collected.
    pub scores: Option<ScoreMatrix>,
}

/// Evaluates a [`Scorer`] against the test interactions of a dataset.
#[derive(Clone, Debug)]
pub struct Evaluator {
    ks: Vec<usize>,
    batch_size: usize,
    candidates: CandidateMode,
    seed: u64,
    collect_scores: bool,
}

impl Evaluator {
    /// Build an evaluator reporting metrics at `ks`.
    pub fn new(ks: &[usize]) -> Self {
        let mut ks = ks.to_vec();
        ks.sort();
        ks.dedup();

        Evaluator {
            ks: ks,
            batch_size: 10_000,
            candidates: CandidateMode::FullCatalog,
            seed: 0,
            collect_scores: false,
        }
    }

    /// Set the number of users scored per call to the model.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the candidate mode.
    pub fn candidates(mut self, candidates: CandidateMode) -> Self {
        self.candidates = candidates;
        self
    }

    /// Set the seed used for sampled negatives.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Keep the full score matrix in the result.
    pub fn collect_scores(mut self, collect_scores: bool) -> Self {
        self.collect_scores = collect_scores;
        self
    }

    /// The cutoffs, ascending.
    pub fn ks(&self) -> &[usize] {
        &self.ks
    }

    /// Run a full evaluation pass over every user with test interactions.
    pub fn evaluate<T: Scorer + Sync>(
        &self,
        model: &T,
        data: &Dataset,
    ) -> Result<Evaluation, PredictionError> {
        let user_ids = data.users_with_test();
        let item_ids: Vec<ItemId> = (0..data.num_items()).collect();
        let k_max = self.ks.last().cloned().unwrap_or(0);

        let mut accumulator = MetricAccumulator::new();
        let mut score_batches: Vec<ScoreMatrix> = Vec::new();
        let mut clipped = Vec::new();

        for batch_user_ids in user_ids.chunks(self.batch_size) {
            let scores = model.predict(batch_user_ids, &item_ids)?;

            if scores.dim() != (batch_user_ids.len(), item_ids.len()) {
                return Err(PredictionError::ScoreShape(
                    batch_user_ids.len(),
                    item_ids.len(),
                    scores.nrows(),
                    scores.ncols(),
                ));
            }

            let results: Vec<(MetricsAtK, Option<usize>)> = batch_user_ids
                .par_iter()
                .enumerate()
                .map(|(row_idx, &user_id)| {
                    let row = scores.row(row_idx);
                    let train_items = data.train_items(user_id);
                    let test_items = data.test_items(user_id);

                    let (ranked, clipped_size) = match self.candidates {
                        CandidateMode::FullCatalog => (
                            rank(
                                item_ids.iter().map(|&item_id| (item_id, row[item_id])),
                                train_items,
                                k_max,
                            ),
                            None,
                        ),
                        CandidateMode::SampledNegatives { num_negatives } => {
                            let mut rng = seeded_rng(self.seed, user_id as u64);
                            let negatives = sample_evaluation_negatives(
                                data.num_items(),
                                train_items,
                                test_items,
                                num_negatives,
                                &mut rng,
                            );
                            let clipped_size = if negatives.len() < num_negatives {
                                Some(negatives.len())
                            } else {
                                None
                            };
                            let ranked = rank(
                                test_items
                                    .iter()
                                    .chain(negatives.iter())
                                    .map(|&item_id| (item_id, row[item_id])),
                                train_items,
                                k_max,
                            );
                            (ranked, clipped_size)
                        }
                    };

                    (compute_metrics(&ranked, test_items, &self.ks), clipped_size)
                })
                .collect();

            for (metrics, clipped_size) in results {
                accumulator.push(&metrics);

                if let Some(size) = clipped_size {
                    clipped.push(size);
                }
            }

            if self.collect_scores {
                score_batches.push(scores);
            }
        }

        if let Some(&smallest) = clipped.iter().min() {
            warn!(
                "Sampled evaluation clipped for {} users: as few as {} negatives were available.",
                clipped.len(),
                smallest
            );
        }

        let scores = if !self.collect_scores {
            None
        } else if score_batches.len() == 1 {
            score_batches.pop()
        } else if score_batches.is_empty() {
            Some(ScoreMatrix::zeros((0, item_ids.len())))
        } else {
            let views: Vec<_> = score_batches.iter().map(|batch| batch.view()).collect();
            let joined = ndarray::concatenate(Axis(0), &views).map_err(|_| {
                PredictionError::ScoreShape(user_ids.len(), item_ids.len(), 0, 0)
            })?;
            Some(joined)
        };

        Ok(Evaluation {
            metrics: accumulator.mean(),
            num_users: accumulator.num_users(),
            user_ids: user_ids,
            scores: scores,
        })
    }
}
