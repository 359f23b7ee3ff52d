//! Downloadable datasets for quick experiments.
use std::env;
use std::fs::{create_dir_all, rename, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use failure;
use reqwest;

use data::{Dataset, Interactions};

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// Can't find the home directory.
    #[fail(display = "Cannot find home directory.")]
    NoHomeDir,
}

/// Directory downloads are cached in: `$BPRMF_DATA`, or `~/.bprmf`.
pub fn data_dir() -> Result<PathBuf, failure::Error> {
    let path = match env::var_os("BPRMF_DATA") {
        Some(dir) => PathBuf::from(dir),
        None => env::home_dir()
            .ok_or_else(|| DatasetError::NoHomeDir)?
            .join(".bprmf"),
    };

    if !path.exists() {
        create_dir_all(&path)?;
    }

    Ok(path)
}

fn download(url: &str, dest_filename: &Path) -> Result<PathBuf, failure::Error> {
    let desired_filename = data_dir()?.join(dest_filename);
    let temp_filename = env::temp_dir().join(dest_filename);

    if !desired_filename.exists() {
        info!("Downloading {} to {}.", url, desired_filename.display());

        let mut writer = BufWriter::new(File::create(&temp_filename)?);
        let mut response = reqwest::get(url)?.error_for_status()?;
        response.copy_to(&mut writer)?;
        drop(writer);

        rename(temp_filename, &desired_filename)?;
    }

    Ok(desired_filename)
}

/// Download the Movielens 100K interactions.
pub fn download_movielens_100k() -> Result<Interactions, failure::Error> {
    let path = download(
        "https://github.com/maciejkula/sbr-rs/raw/master/data.csv",
        Path::new("movielens_100K.csv"),
    )?;

    Interactions::from_csv(path)
}

/// Download Movielens 100K and split it at random into train and test sets.
pub fn movielens_100k_dataset(test_fraction: f32, seed: u64) -> Result<Dataset, failure::Error> {
    let mut interactions = download_movielens_100k()?;
    Ok(Dataset::from_split(&mut interactions, test_fraction, seed))
}
