//! Checkpoints, the per-evaluation metrics table, and score dumps.
//!
//! Checkpoints are JSON documents named `model_epoch{N}.json`; only the
//! latest best one is kept. The metrics table is tab-separated, with one
//! row per evaluation: `epoch_idx`, `loss`, then `{metric}@{K}` for every
//! cutoff and metric.
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use csv;
use failure;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json;

use metrics::Metric;
use training::EpochRecord;
use {ScoreMatrix, UserId};

/// Parameters saved at an epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    /// Epoch (1-indexed) the parameters were saved at.
    pub epoch: usize,
    /// The model parameters.
    pub state: S,
}

/// Destination for the artefacts of a training run.
pub trait Store {
    /// Save a checkpoint, discarding the one saved at `previous_epoch`.
    fn save_checkpoint<S: Serialize>(
        &mut self,
        checkpoint: &Checkpoint<S>,
        previous_epoch: Option<usize>,
    ) -> Result<(), failure::Error>;

    /// Write out the metrics table.
    fn save_metrics(&mut self, ks: &[usize], records: &[EpochRecord]) -> Result<(), failure::Error>;
}

/// Write the metrics table as tab-separated values.
pub fn write_metrics_table<W: io::Write>(
    writer: W,
    ks: &[usize],
    records: &[EpochRecord],
) -> Result<(), failure::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    let mut header = vec!["epoch_idx".to_owned(), "loss".to_owned()];
    for k in ks {
        for metric in Metric::ALL.iter() {
            header.push(format!("{}@{}", metric, k));
        }
    }
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![record.epoch.to_string(), record.loss.to_string()];

        for k in ks {
            let values = record.metrics.get(k);

            for metric in Metric::ALL.iter() {
                row.push(
                    values
                        .map(|values| values.get(*metric).to_string())
                        .unwrap_or_default(),
                );
            }
        }

        writer.write_record(&row)?;
    }

    writer.flush()?;

    Ok(())
}

/// Write a score matrix as tab-separated values: a header of item ids,
/// then one row per user.
pub fn write_scores<W: io::Write>(
    writer: W,
    user_ids: &[UserId],
    scores: &ScoreMatrix,
) -> Result<(), failure::Error> {
    if user_ids.len() != scores.nrows() {
        bail!(
            "Got {} users for a score matrix with {} rows.",
            user_ids.len(),
            scores.nrows()
        );
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);

    let mut header = vec!["user_id".to_owned()];
    header.extend((0..scores.ncols()).map(|item_id| item_id.to_string()));
    writer.write_record(&header)?;

    for (user_id, row) in user_ids.iter().zip(scores.outer_iter()) {
        let mut record = vec![user_id.to_string()];
        record.extend(row.iter().map(|score| score.to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;

    Ok(())
}

/// Read a checkpoint written by a [`FileStore`].
pub fn load_checkpoint<S: DeserializeOwned, P: AsRef<Path>>(
    path: P,
) -> Result<Checkpoint<S>, failure::Error> {
    let file = fs::File::open(path.as_ref())
        .map_err(|error| format_err!("Unable to open {:?}: {}", path.as_ref(), error))?;

    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

/// Writes run artefacts into a directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, failure::Error> {
        fs::create_dir_all(dir.as_ref())?;

        Ok(FileStore {
            dir: dir.as_ref().to_owned(),
        })
    }

    /// Path of the checkpoint for `epoch`.
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model_epoch{}.json", epoch))
    }

    fn partial_checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model_epoch{}.json.partial", epoch))
    }

    /// Path of the metrics table.
    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.tsv")
    }

    /// Path of the score dump.
    pub fn scores_path(&self) -> PathBuf {
        self.dir.join("scores.tsv")
    }
}

impl Store for FileStore {
    fn save_checkpoint<S: Serialize>(
        &mut self,
        checkpoint: &Checkpoint<S>,
        previous_epoch: Option<usize>,
    ) -> Result<(), failure::Error> {
        // The previous checkpoint is only removed once the new one is
        // fully on disk under its final name.
        let partial_path = self.partial_checkpoint_path(checkpoint.epoch);
        let mut writer = io::BufWriter::new(fs::File::create(&partial_path)?);
        serde_json::to_writer(&mut writer, checkpoint)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&partial_path, self.checkpoint_path(checkpoint.epoch))?;

        if let Some(previous) = previous_epoch {
            let previous_path = self.checkpoint_path(previous);

            if previous != checkpoint.epoch && previous_path.exists() {
                fs::remove_file(previous_path)?;
            }
        }

        Ok(())
    }

    fn save_metrics(&mut self, ks: &[usize], records: &[EpochRecord]) -> Result<(), failure::Error> {
        let file = fs::File::create(self.metrics_path())?;
        write_metrics_table(io::BufWriter::new(file), ks, records)
    }
}

/// Keeps run artefacts in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    checkpoints: BTreeMap<usize, serde_json::Value>,
    metrics: Option<String>,
}

impl MemoryStore {
    /// Epochs with a stored checkpoint.
    pub fn checkpoint_epochs(&self) -> Vec<usize> {
        self.checkpoints.keys().cloned().collect()
    }

    /// Read back the checkpoint saved at `epoch`.
    pub fn checkpoint<S: DeserializeOwned>(&self, epoch: usize) -> Result<Checkpoint<S>, failure::Error> {
        match self.checkpoints.get(&epoch) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => bail!("No checkpoint for epoch {}.", epoch),
        }
    }

    /// The metrics table, once written.
    pub fn metrics(&self) -> Option<&str> {
        self.metrics.as_ref().map(|metrics| metrics.as_str())
    }
}

impl Store for MemoryStore {
    fn save_checkpoint<S: Serialize>(
        &mut self,
        checkpoint: &Checkpoint<S>,
        previous_epoch: Option<usize>,
    ) -> Result<(), failure::Error> {
        let value = serde_json::to_value(checkpoint)?;

        if let Some(previous) = previous_epoch {
            self.checkpoints.remove(&previous);
        }

        self.checkpoints.insert(checkpoint.epoch, value);

        Ok(())
    }

    fn save_metrics(&mut self, ks: &[usize], records: &[EpochRecord]) -> Result<(), failure::Error> {
        let mut buffer = Vec::new();
        write_metrics_table(&mut buffer, ks, records)?;
        self.metrics = Some(String::from_utf8(buffer)?);

        Ok(())
    }
}
