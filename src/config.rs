use std::{env, path::PathBuf};

use burn::config::Config;

use crate::error::Error;

/// Index at which the shuffled dataset is split into train/validation views.
pub const DATA_PARTITION: usize = 5973;

pub const ENV_DATASET_SOURCE: &str = "TRAINING_DATASET_SOURCE";
pub const ENV_DATASET_DESTINATION: &str = "TRAINING_DATASET_DESTINATION";
pub const ENV_WEIGHTS: &str = "WEIGHTS";

#[derive(Config, Debug)]
pub struct SearchConfig {
    pub dataset_source: PathBuf,

    pub dataset_destination: PathBuf,

    pub weights_dir: PathBuf,

    pub runs_dir: PathBuf,

    #[config(default = 5973)]
    pub split_index: usize,

    #[config(default = 200)]
    pub trial_count: usize,

    /// Exclusive epoch bound; epochs run 1..max_epochs.
    #[config(default = 300)]
    pub max_epochs: usize,

    #[config(default = 1)]
    pub seed: u64,
}

impl SearchConfig {
    /// Builds the configuration from the process environment. Any missing
    /// variable is fatal.
    pub fn from_env() -> crate::error::Result<Self> {
        let source = require_env(ENV_DATASET_SOURCE)?;
        let destination = require_env(ENV_DATASET_DESTINATION)?;
        let weights: PathBuf = require_env(ENV_WEIGHTS)?;
        let runs = weights.join("runs");

        Ok(Self::new(source, destination, weights, runs))
    }
}

fn require_env(name: &'static str) -> crate::error::Result<PathBuf> {
    env::var(name)
        .map(PathBuf::from)
        .map_err(|_| Error::MissingEnv(name))
}
