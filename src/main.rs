use std::fs;

use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use burn::config::Config as _;
use burn::data::dataset::Dataset;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::SearchConfig;
use data::PartGraphDataset;
use search::{Direction, MedianPruner, Study};
use tracking::JsonlRunSink;

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod module;
pub mod search;
pub mod tracking;
pub mod training;

const STUDY_NAME: &str = "cafr-furniture-parts";

fn main() -> error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let config = SearchConfig::from_env()?;
    let device = WgpuDevice::default();
    info!(?device, study = STUDY_NAME, "starting hyperparameter search");

    fs::create_dir_all(&config.runs_dir)?;
    config.save(config.runs_dir.join("config.json"))?;

    let dataset = PartGraphDataset::load(&config.dataset_source, &config.dataset_destination)?;
    info!(
        samples = dataset.len(),
        feature_dim = dataset.feature_dim(),
        classes = dataset.class_count(),
        "dataset ready"
    );

    let mut sink = JsonlRunSink::new(config.runs_dir.clone());
    let mut study = Study::new(Direction::Maximize, MedianPruner::default(), config.seed);

    let best = study.optimize(config.trial_count, |trial| {
        training::objective::<AutodiffBackend>(trial, &dataset, &config, &device, &mut sink)
    })?;

    match best {
        Some(best) => info!(
            trial = best.number,
            score = best.score,
            params = ?best.params,
            "search finished"
        ),
        None => info!("search finished with no completed trials"),
    }

    Ok(())
}
