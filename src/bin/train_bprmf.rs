//! Train a BPR matrix factorization model, or evaluate a saved one.
//!
//! ```text
//! train_bprmf train <run.json>
//! train_bprmf predict <run.json> <model_epochN.json>
//! ```
//!
//! Logging is controlled through `RUST_LOG` and defaults to `info`.
extern crate bprmf;
extern crate env_logger;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
extern crate serde_json;
#[macro_use]
extern crate serde_derive;

use std::env;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process;

use bprmf::data::Dataset;
use bprmf::models::factorization::{FactorizationState, Hyperparameters,
                                   ImplicitFactorizationModel};
use bprmf::models::{Loss, Optimizer};
use bprmf::persistence::{load_checkpoint, write_scores, FileStore};
use bprmf::training::{fit, log_evaluation, TrainingConfig};

#[derive(Clone, Debug, Deserialize)]
enum DataSource {
    /// Directory with `train.txt` and `test.txt` adjacency lists.
    Adjacency { dir: PathBuf },
    /// `user_id,item_id,timestamp` CSV file, split at random.
    Csv { path: PathBuf, test_fraction: f32 },
    /// Movielens 100K, downloaded on first use and split at random.
    #[cfg(feature = "download")]
    Movielens100k { test_fraction: f32 },
}

impl DataSource {
    fn load(&self, seed: u64) -> Result<Dataset, failure::Error> {
        match *self {
            DataSource::Adjacency { ref dir } => Dataset::from_adjacency_dir(dir),
            DataSource::Csv {
                ref path,
                test_fraction,
            } => Dataset::from_csv(path, test_fraction, seed),
            #[cfg(feature = "download")]
            DataSource::Movielens100k { test_fraction } => {
                bprmf::datasets::movielens_100k_dataset(test_fraction, seed)
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ModelConfig {
    latent_dim: usize,
    learning_rate: f32,
    l2_penalty: f32,
    loss: Loss,
    optimizer: Optimizer,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            latent_dim: 64,
            learning_rate: 0.0001,
            l2_penalty: 1e-5,
            loss: Loss::BPR,
            optimizer: Optimizer::Adam,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct RunConfig {
    data: DataSource,
    save_dir: PathBuf,
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    training: TrainingConfig,
}

impl RunConfig {
    fn from_path(path: &Path) -> Result<Self, failure::Error> {
        let file = File::open(path)
            .map_err(|error| format_err!("Unable to open {}: {}", path.display(), error))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn hyperparameters(&self, data: &Dataset) -> Hyperparameters {
        Hyperparameters::new(data.num_users(), data.num_items())
            .latent_dim(self.model.latent_dim)
            .learning_rate(self.model.learning_rate)
            .l2_penalty(self.model.l2_penalty)
            .loss(self.model.loss)
            .optimizer(self.model.optimizer)
            .from_seed(self.training.seed)
    }
}

fn train(config: &RunConfig) -> Result<(), failure::Error> {
    let training = config.training.clone().validate()?;
    let data = config.data.load(training.seed)?;

    let mut model = config.hyperparameters(&data).build();
    let mut store = FileStore::new(&config.save_dir)?;

    let outcome = fit(&mut model, &data, &training, &mut store)?;

    info!(
        "Trained for {} epochs{}; metrics written to {}.",
        outcome.epochs_run,
        if outcome.stopped_early {
            " (stopped early)"
        } else {
            ""
        },
        store.metrics_path().display()
    );

    if let Some(best) = outcome.best {
        info!(
            "Best model: {}",
            store.checkpoint_path(best.epoch).display()
        );
    }

    Ok(())
}

fn predict(config: &RunConfig, checkpoint_path: &Path) -> Result<(), failure::Error> {
    let training = config.training.clone().validate()?;
    let data = config.data.load(training.seed)?;

    let checkpoint = load_checkpoint::<FactorizationState, _>(checkpoint_path)?;
    let model = ImplicitFactorizationModel::from_state(config.hyperparameters(&data), checkpoint.state)?;

    let evaluation = training
        .evaluator()
        .collect_scores(true)
        .evaluate(&model, &data)?;

    log_evaluation(
        &format!("Evaluation: Checkpoint of epoch {:04}", checkpoint.epoch),
        &evaluation.metrics,
    );

    let store = FileStore::new(&config.save_dir)?;

    if let Some(ref scores) = evaluation.scores {
        let writer = BufWriter::new(File::create(store.scores_path())?);
        write_scores(writer, &evaluation.user_ids, scores)?;
        info!("Scores written to {}.", store.scores_path().display());
    }

    Ok(())
}

fn run(args: &[String]) -> Result<(), failure::Error> {
    match *args {
        [_, ref mode, ref config] if mode == "train" => {
            train(&RunConfig::from_path(Path::new(config))?)
        }
        [_, ref mode, ref config, ref checkpoint] if mode == "predict" => predict(
            &RunConfig::from_path(Path::new(config))?,
            Path::new(checkpoint),
        ),
        _ => Err(failure::err_msg(
            "Usage: train_bprmf train <run.json> | train_bprmf predict <run.json> <checkpoint.json>",
        )),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    if let Err(error) = run(&args) {
        error!("{}", error);
        process::exit(1);
    }
}
