use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    search::TrialParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Completed,
    Pruned,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub training_loss: f64,
    pub val_loss: f64,
    pub train_f1: f64,
    pub val_f1: f64,
}

/// One line of a run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Start {
        trial: usize,
        params: TrialParams,
    },
    Epoch {
        epoch: usize,
        #[serde(flatten)]
        metrics: EpochMetrics,
    },
    Summary {
        #[serde(skip_serializing_if = "Option::is_none")]
        final_f_score: Option<f64>,
        state: RunState,
    },
}

/// Per-trial metrics session: opened with the sampled configuration, fed
/// one record per epoch, closed with a terminal summary.
pub trait RunSink {
    fn start(&mut self, trial: usize, params: &TrialParams) -> Result<()>;
    fn log_epoch(&mut self, epoch: usize, metrics: &EpochMetrics) -> Result<()>;
    fn finish(&mut self, final_f_score: Option<f64>, state: RunState) -> Result<()>;
}

/// Writes one JSONL file per trial under the runs directory.
pub struct JsonlRunSink {
    root: PathBuf,
    current: Option<BufWriter<File>>,
}

impl JsonlRunSink {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            current: None,
        }
    }

    pub fn run_path(&self, trial: usize) -> PathBuf {
        self.root.join(format!("trial-{trial:03}.jsonl"))
    }

    fn write_event(&mut self, event: &RunEvent) -> Result<()> {
        let writer = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Tracking("no active run".into()))?;
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;

        Ok(())
    }
}

impl RunSink for JsonlRunSink {
    fn start(&mut self, trial: usize, params: &TrialParams) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::Tracking("previous run not finished".into()));
        }

        fs::create_dir_all(&self.root)?;
        let file = File::create(self.run_path(trial))?;
        self.current = Some(BufWriter::new(file));

        self.write_event(&RunEvent::Start {
            trial,
            params: params.clone(),
        })
    }

    fn log_epoch(&mut self, epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        self.write_event(&RunEvent::Epoch {
            epoch,
            metrics: *metrics,
        })
    }

    fn finish(&mut self, final_f_score: Option<f64>, state: RunState) -> Result<()> {
        self.write_event(&RunEvent::Summary {
            final_f_score,
            state,
        })?;

        if let Some(mut writer) = self.current.take() {
            writer.flush()?;
        }
        info!(?state, final_f_score, "run finished");

        Ok(())
    }
}

#[cfg(test)]
pub fn read_run(path: &std::path::Path) -> Vec<RunEvent> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn params() -> TrialParams {
        TrialParams::sample(&mut StdRng::seed_from_u64(0))
    }

    fn metrics(val_f1: f64) -> EpochMetrics {
        EpochMetrics {
            training_loss: 0.7,
            val_loss: 0.6,
            train_f1: 0.5,
            val_f1,
        }
    }

    #[test]
    fn completed_run_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlRunSink::new(dir.path().join("runs"));

        sink.start(3, &params()).unwrap();
        sink.log_epoch(1, &metrics(0.4)).unwrap();
        sink.log_epoch(2, &metrics(0.6)).unwrap();
        sink.finish(Some(0.6), RunState::Completed).unwrap();

        let events = read_run(&sink.run_path(3));
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            RunEvent::Start {
                trial: 3,
                params: params(),
            }
        );
        assert_eq!(
            events[3],
            RunEvent::Summary {
                final_f_score: Some(0.6),
                state: RunState::Completed,
            }
        );
    }

    #[test]
    fn pruned_summary_omits_final_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlRunSink::new(dir.path().to_path_buf());

        sink.start(0, &params()).unwrap();
        sink.log_epoch(1, &metrics(0.1)).unwrap();
        sink.finish(None, RunState::Pruned).unwrap();

        let raw = std::fs::read_to_string(sink.run_path(0)).unwrap();
        let last = raw.lines().last().unwrap();
        assert!(!last.contains("final_f_score"));
        assert!(last.contains("pruned"));
    }

    #[test]
    fn sink_can_host_consecutive_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlRunSink::new(dir.path().to_path_buf());

        for trial in 0..2 {
            sink.start(trial, &params()).unwrap();
            sink.log_epoch(1, &metrics(0.2)).unwrap();
            sink.finish(Some(0.2), RunState::Completed).unwrap();
        }

        assert!(sink.run_path(0).is_file());
        assert!(sink.run_path(1).is_file());
    }

    #[test]
    fn logging_without_a_run_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlRunSink::new(dir.path().to_path_buf());

        assert!(matches!(
            sink.log_epoch(1, &metrics(0.2)),
            Err(Error::Tracking(_))
        ));
    }
}
