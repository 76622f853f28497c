use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

pub const HIDDEN_CHANNEL_CHOICES: [usize; 6] = [16, 32, 64, 128, 256, 512];
pub const BATCH_SIZE_CHOICES: [usize; 4] = [16, 32, 64, 128];
pub const LEARNING_RATE_CHOICES: [f64; 3] = [0.01, 0.001, 0.0001];

/// One sampled hyperparameter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    pub conv_layer_count: usize,
    pub hidden_channels: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub dropout: f64,
}

impl TrialParams {
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        Self {
            conv_layer_count: rng.gen_range(2..=7),
            hidden_channels: HIDDEN_CHANNEL_CHOICES[rng.gen_range(0..HIDDEN_CHANNEL_CHOICES.len())],
            batch_size: BATCH_SIZE_CHOICES[rng.gen_range(0..BATCH_SIZE_CHOICES.len())],
            learning_rate: LEARNING_RATE_CHOICES[rng.gen_range(0..LEARNING_RATE_CHOICES.len())],
            // 0.1..=0.5, step 0.1
            dropout: 0.1 * rng.gen_range(1..=5) as f64,
        }
    }
}

/// How a trial ended. Pruning is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialOutcome {
    Completed { score: f64 },
    Pruned { epoch: usize },
}

/// A finished trial as kept by the study: its configuration, every
/// intermediate report and the outcome.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub number: usize,
    pub params: TrialParams,
    pub reports: Vec<(usize, f64)>,
    pub outcome: TrialOutcome,
}

impl TrialRecord {
    pub fn report_at(&self, epoch: usize) -> Option<f64> {
        self.reports
            .iter()
            .find(|(e, _)| *e == epoch)
            .map(|(_, value)| *value)
    }
}

/// Live handle passed to the objective: reports intermediate values and
/// consults the pruner against the study's history.
pub struct Trial<'a> {
    number: usize,
    params: TrialParams,
    reports: Vec<(usize, f64)>,
    pruner: &'a MedianPruner,
    history: &'a [TrialRecord],
}

impl<'a> Trial<'a> {
    pub fn new(
        number: usize,
        params: TrialParams,
        pruner: &'a MedianPruner,
        history: &'a [TrialRecord],
    ) -> Self {
        Self {
            number,
            params,
            reports: Vec::new(),
            pruner,
            history,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn params(&self) -> &TrialParams {
        &self.params
    }

    pub fn report(&mut self, epoch: usize, value: f64) {
        self.reports.push((epoch, value));
    }

    /// Whether the latest reported value falls below the other trials'
    /// trajectories at the same epoch.
    pub fn should_prune(&self) -> bool {
        let Some(&(epoch, value)) = self.reports.last() else {
            return false;
        };

        self.pruner.should_prune(self.history, epoch, value)
    }

    pub fn into_record(self, outcome: TrialOutcome) -> TrialRecord {
        TrialRecord {
            number: self.number,
            params: self.params,
            reports: self.reports,
            outcome,
        }
    }
}

/// Prunes a trial whose report is strictly below the median of prior
/// trials' reports at the same epoch. Inert until `startup_trials` trials
/// have completed and during the first `warmup_epochs` epochs.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    pub startup_trials: usize,
    pub warmup_epochs: usize,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            startup_trials: 5,
            warmup_epochs: 0,
        }
    }
}

impl MedianPruner {
    pub fn should_prune(&self, history: &[TrialRecord], epoch: usize, value: f64) -> bool {
        if epoch <= self.warmup_epochs {
            return false;
        }

        let completed = history
            .iter()
            .filter(|record| matches!(record.outcome, TrialOutcome::Completed { .. }))
            .count();
        if completed < self.startup_trials {
            return false;
        }

        let mut values: Vec<f64> = history
            .iter()
            .filter_map(|record| record.report_at(epoch))
            .collect();
        if values.is_empty() {
            return false;
        }
        values.sort_by(f64::total_cmp);

        value < median(&values)
    }
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BestTrial {
    pub number: usize,
    pub params: TrialParams,
    pub score: f64,
}

/// Sequentially runs trials against an objective, recording outcomes and
/// tracking the best completed trial. An `Err` from the objective is fatal
/// and aborts the remaining trials.
pub struct Study {
    direction: Direction,
    pruner: MedianPruner,
    records: Vec<TrialRecord>,
    rng: StdRng,
}

impl Study {
    pub fn new(direction: Direction, pruner: MedianPruner, seed: u64) -> Self {
        Self {
            direction,
            pruner,
            records: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn optimize<F>(&mut self, trial_count: usize, mut objective: F) -> Result<Option<BestTrial>>
    where
        F: FnMut(&mut Trial<'_>) -> Result<TrialOutcome>,
    {
        let mut best: Option<BestTrial> = None;

        for number in 0..trial_count {
            let params = TrialParams::sample(&mut self.rng);

            let record = {
                let mut trial = Trial::new(number, params, &self.pruner, &self.records);
                let outcome = objective(&mut trial)?;
                trial.into_record(outcome)
            };

            match record.outcome {
                TrialOutcome::Completed { score } => {
                    info!(trial = number, score, "trial completed");
                    let improved = best
                        .as_ref()
                        .is_none_or(|incumbent| self.direction.is_better(score, incumbent.score));
                    if improved {
                        best = Some(BestTrial {
                            number,
                            params: record.params.clone(),
                            score,
                        });
                    }
                }
                TrialOutcome::Pruned { epoch } => {
                    info!(trial = number, epoch, "trial pruned");
                }
            }

            self.records.push(record);
        }

        Ok(best)
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }
}
