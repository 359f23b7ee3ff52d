//! The training loop: epochs of pairwise updates, periodic evaluation,
//! early stopping and checkpointing of the best model.
use std::time::Instant;

use data::Dataset;
use early_stopping::{Decision, EarlyStopping};
use evaluation::{CandidateMode, Evaluation, Evaluator};
use metrics::{MetricValues, MetricsAtK};
use persistence::{Checkpoint, Store};
use sampling::{seeded_rng, BatchSampler};
use {FittingError, PairwiseModel};

/// Rejected training configurations.
#[derive(Debug, Fail, PartialEq, Eq)]
pub enum ConfigError {
    /// No cutoffs were given.
    #[fail(display = "At least one cutoff K is required.")]
    EmptyKs,
    /// A cutoff of zero was given.
    #[fail(display = "Cutoffs must be positive.")]
    ZeroK,
    /// Zero training batch size.
    #[fail(display = "Training batch size must be positive.")]
    ZeroBatchSize,
    /// Zero evaluation batch size.
    #[fail(display = "Evaluation batch size must be positive.")]
    ZeroTestBatchSize,
    /// Zero evaluation cadence.
    #[fail(display = "Evaluation cadence must be positive.")]
    ZeroEvaluateEvery,
    /// Zero epochs.
    #[fail(display = "Number of epochs must be positive.")]
    ZeroEpochs,
    /// Zero logging cadence.
    #[fail(display = "Logging cadence must be positive.")]
    ZeroPrintEvery,
}

/// Configuration of a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Cutoffs at which metrics are reported. The smallest one drives
    /// early stopping and checkpointing through its recall.
    pub ks: Vec<usize>,
    /// Number of triples per optimizer step.
    pub train_batch_size: usize,
    /// Number of users scored at once during evaluation.
    pub test_batch_size: usize,
    /// Evaluate every this many epochs (and after the last one).
    pub evaluate_every: usize,
    /// Maximum number of epochs.
    pub num_epochs: usize,
    /// Evaluations allowed without reaching the best recall before stopping.
    pub stopping_steps: usize,
    /// Log the batch loss every this many iterations.
    pub print_every: usize,
    /// Candidate items for evaluation.
    pub candidates: CandidateMode,
    /// Seed for batch shuffling, negative sampling and sampled evaluation.
    pub seed: u64,
    /// Load the best parameters back into the model when training ends.
    pub restore_best: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            ks: vec![20, 40, 60, 80, 100],
            train_batch_size: 1024,
            test_batch_size: 10_000,
            evaluate_every: 10,
            num_epochs: 1000,
            stopping_steps: 10,
            print_every: 1,
            candidates: CandidateMode::FullCatalog,
            seed: 2019,
            restore_best: false,
        }
    }
}

impl TrainingConfig {
    /// Set the cutoffs.
    pub fn ks(mut self, ks: Vec<usize>) -> Self {
        self.ks = ks;
        self
    }

    /// Set the training batch size.
    pub fn train_batch_size(mut self, train_batch_size: usize) -> Self {
        self.train_batch_size = train_batch_size;
        self
    }

    /// Set the evaluation batch size.
    pub fn test_batch_size(mut self, test_batch_size: usize) -> Self {
        self.test_batch_size = test_batch_size;
        self
    }

    /// Set the evaluation cadence.
    pub fn evaluate_every(mut self, evaluate_every: usize) -> Self {
        self.evaluate_every = evaluate_every;
        self
    }

    /// Set the maximum number of epochs.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the early-stopping patience.
    pub fn stopping_steps(mut self, stopping_steps: usize) -> Self {
        self.stopping_steps = stopping_steps;
        self
    }

    /// Set the logging cadence.
    pub fn print_every(mut self, print_every: usize) -> Self {
        self.print_every = print_every;
        self
    }

    /// Set the evaluation candidates.
    pub fn candidates(mut self, candidates: CandidateMode) -> Self {
        self.candidates = candidates;
        self
    }

    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Restore the best parameters at the end of training.
    pub fn restore_best(mut self, restore_best: bool) -> Self {
        self.restore_best = restore_best;
        self
    }

    /// Check the configuration, sorting and deduplicating the cutoffs.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.ks.is_empty() {
            return Err(ConfigError::EmptyKs);
        }
        if self.ks.contains(&0) {
            return Err(ConfigError::ZeroK);
        }
        if self.train_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.test_batch_size == 0 {
            return Err(ConfigError::ZeroTestBatchSize);
        }
        if self.evaluate_every == 0 {
            return Err(ConfigError::ZeroEvaluateEvery);
        }
        if self.num_epochs == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.print_every == 0 {
            return Err(ConfigError::ZeroPrintEvery);
        }

        self.ks.sort();
        self.ks.dedup();

        Ok(self)
    }

    /// The evaluator described by this configuration.
    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(&self.ks)
            .batch_size(self.test_batch_size)
            .candidates(self.candidates)
            .seed(self.seed)
    }
}

/// Metrics recorded at one evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Epoch (1-indexed).
    pub epoch: usize,
    /// Mean batch loss over the epoch.
    pub loss: f32,
    /// Mean metrics by cutoff.
    pub metrics: MetricsAtK,
}

/// The best evaluation of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct BestEpoch {
    /// Epoch (1-indexed).
    pub epoch: usize,
    /// Recall at the smallest cutoff.
    pub recall: f64,
    /// Mean metrics by cutoff.
    pub metrics: MetricsAtK,
}

/// Summary of a finished training run.
#[derive(Clone, Debug)]
pub struct TrainingOutcome {
    /// One record per evaluation, in order.
    pub records: Vec<EpochRecord>,
    /// The checkpointed evaluation, if any.
    pub best: Option<BestEpoch>,
    /// Number of epochs trained.
    pub epochs_run: usize,
    /// Whether training ended on patience rather than the epoch limit.
    pub stopped_early: bool,
}

fn values_at(metrics: &MetricsAtK, k: usize) -> MetricValues {
    metrics.get(&k).cloned().unwrap_or_default()
}

/// Log precision, recall, NDCG, F1 and MAP at the smallest and largest cutoffs.
pub fn log_evaluation(prefix: &str, metrics: &MetricsAtK) {
    let (k_min, k_max) = match (metrics.keys().next(), metrics.keys().next_back()) {
        (Some(&k_min), Some(&k_max)) => (k_min, k_max),
        _ => return,
    };
    let (min, max) = (values_at(metrics, k_min), values_at(metrics, k_max));

    info!(
        "{} | Precision [{:.4}, {:.4}], Recall [{:.4}, {:.4}], NDCG [{:.4}, {:.4}], \
         F1 [{:.4}, {:.4}], MAP [{:.4}, {:.4}]",
        prefix,
        min.precision,
        max.precision,
        min.recall,
        max.recall,
        min.ndcg,
        max.ndcg,
        min.f1,
        max.f1,
        min.map,
        max.map
    );
}

fn seconds(start: Instant) -> f64 {
    let elapsed = start.elapsed();
    elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9
}

/// Train `model` on `data`.
///
/// Every epoch is one shuffled pass over the training interactions. The
/// model is evaluated every `evaluate_every` epochs and after the last
/// epoch; whenever recall at the smallest cutoff strictly improves, the
/// parameters are checkpointed into `store`. Training ends early once
/// `stopping_steps` evaluations pass without matching the best recall.
///
/// A non-finite batch loss aborts training before the optimizer step.
/// Checkpoint failures are logged and training continues; failing to
/// write the metrics table is an error.
pub fn fit<M, S>(
    model: &mut M,
    data: &Dataset,
    config: &TrainingConfig,
    store: &mut S,
) -> Result<TrainingOutcome, FittingError>
where
    M: PairwiseModel + Sync,
    S: Store,
{
    let config = config.clone().validate()?;

    if data.num_train_interactions() == 0 {
        return Err(FittingError::NoInteractions);
    }

    let evaluator = config.evaluator();
    let k_min = config.ks[0];

    let mut sampler = BatchSampler::new(data, seeded_rng(config.seed, 0));
    let num_batches = sampler.num_batches(config.train_batch_size);

    let mut stopping = EarlyStopping::new(config.stopping_steps);
    let mut records = Vec::new();
    let mut best: Option<BestEpoch> = None;
    let mut best_snapshot = None;
    let mut epochs_run = 0;
    let mut stopped_early = false;

    for epoch in 1..=config.num_epochs {
        let epoch_start = Instant::now();
        let mut total_loss = 0.0;
        let mut num_steps: u32 = 0;

        for (idx, batch) in sampler.epoch(config.train_batch_size).enumerate() {
            let iteration = idx + 1;

            if batch.is_empty() {
                continue;
            }

            let batch_start = Instant::now();
            let loss = model.batch_loss(
                &batch.user_ids,
                &batch.positive_item_ids,
                &batch.negative_item_ids,
            )?;

            if !loss.is_finite() {
                error!(
                    "Epoch {:04} Iter {:04} / {:04}: loss is {}.",
                    epoch, iteration, num_batches, loss
                );
                return Err(FittingError::NonFiniteLoss {
                    epoch: epoch,
                    iteration: iteration,
                    loss: loss,
                });
            }

            model.step();

            total_loss += f64::from(loss);
            num_steps += 1;

            if iteration % config.print_every == 0 {
                debug!(
                    "Training: Epoch {:04} Iter {:04} / {:04} | Time {:.1}s | Iter Loss {:.4} | Iter Mean Loss {:.4}",
                    epoch,
                    iteration,
                    num_batches,
                    seconds(batch_start),
                    loss,
                    total_loss / f64::from(num_steps)
                );
            }
        }

        epochs_run = epoch;

        let mean_loss = if num_steps > 0 {
            (total_loss / f64::from(num_steps)) as f32
        } else {
            0.0
        };

        info!(
            "Training: Epoch {:04} Total Iter {:04} | Total Time {:.1}s | Iter Mean Loss {:.4}",
            epoch,
            num_batches,
            seconds(epoch_start),
            mean_loss
        );

        if epoch % config.evaluate_every != 0 && epoch != config.num_epochs {
            continue;
        }

        let evaluation_start = Instant::now();
        let Evaluation { metrics, .. } = evaluator.evaluate(&*model, data)?;

        log_evaluation(
            &format!(
                "Evaluation: Epoch {:04} | Total Time {:.1}s",
                epoch,
                seconds(evaluation_start)
            ),
            &metrics,
        );

        let recall = values_at(&metrics, k_min).recall;

        records.push(EpochRecord {
            epoch: epoch,
            loss: mean_loss,
            metrics: metrics.clone(),
        });

        match stopping.record(recall) {
            Decision::Stop => {
                info!(
                    "No improvement in recall@{} for {} evaluations, stopping at epoch {}.",
                    k_min, config.stopping_steps, epoch
                );
                stopped_early = true;
                break;
            }
            Decision::Improved => {
                let snapshot = model.snapshot();
                let previous_epoch = best.as_ref().map(|best| best.epoch);

                match store.save_checkpoint(
                    &Checkpoint {
                        epoch: epoch,
                        state: &snapshot,
                    },
                    previous_epoch,
                ) {
                    Ok(()) => info!("Saved model on epoch {:04}.", epoch),
                    Err(error) => warn!("Unable to save model on epoch {}: {}", epoch, error),
                }

                best = Some(BestEpoch {
                    epoch: epoch,
                    recall: recall,
                    metrics: metrics,
                });

                if config.restore_best {
                    best_snapshot = Some(snapshot);
                }
            }
            Decision::Continue => {}
        }
    }

    store
        .save_metrics(&config.ks, &records)
        .map_err(FittingError::Persistence)?;

    if let Some(ref best) = best {
        log_evaluation(
            &format!("Best Evaluation: Epoch {:04}", best.epoch),
            &best.metrics,
        );
    }

    if let Some(snapshot) = best_snapshot {
        model.restore(&snapshot);
    }

    Ok(TrainingOutcome {
        records: records,
        best: best,
        epochs_run: epochs_run,
        stopped_early: stopped_early,
    })
}
