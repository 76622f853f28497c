use std::fs;

use burn::{
    module::AutodiffModule,
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::{activation::sigmoid, backend::AutodiffBackend},
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::info;

use crate::{
    config::SearchConfig,
    data::{GraphBatcher, GraphLoader, PartGraphDataset},
    error::{Error, Result},
    model::{Model, ModelConfig},
    search::{Trial, TrialOutcome},
    tracking::{EpochMetrics, RunSink, RunState},
};

/// Weights are written to `<weights_dir>/weights` (recorder adds its own
/// extension), overwritten by every completed trial.
pub const WEIGHTS_FILE: &str = "weights";

const SCHEDULER_FACTOR: f64 = 0.1;
const SCHEDULER_PATIENCE: usize = 25;

/// Reduce-on-plateau learning rate schedule over a maximized metric: after
/// `patience` consecutive epochs without improvement the rate is multiplied
/// by `factor`.
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    best: f64,
    stale: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            best: f64::NEG_INFINITY,
            stale: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn observe(&mut self, metric: f64) {
        if metric > self.best {
            self.best = metric;
            self.stale = 0;
            return;
        }

        self.stale += 1;
        if self.stale > self.patience {
            self.lr *= self.factor;
            self.stale = 0;
            info!(lr = self.lr, "learning rate reduced on plateau");
        }
    }
}

/// Micro-averaged F1 over accumulated confusion counts. 0 when no positives
/// exist on either side.
pub fn micro_f1(true_positives: i64, false_positives: i64, false_negatives: i64) -> f64 {
    let denominator = 2 * true_positives + false_positives + false_negatives;
    if denominator == 0 {
        return 0.0;
    }

    2.0 * true_positives as f64 / denominator as f64
}

fn train_epoch<B: AutodiffBackend, O: Optimizer<Model<B>, B>>(
    mut model: Model<B>,
    loader: &mut GraphLoader<B>,
    criterion: &BinaryCrossEntropyLoss<B>,
    optimizer: &mut O,
    lr: f64,
) -> (Model<B>, f64) {
    let mut total_loss = 0.0;
    let mut batches = 0;

    for batch in loader.iter() {
        let logits = model.forward(&batch);
        let loss = criterion.forward(
            logits.flatten::<1>(0, 1),
            batch.targets.clone().flatten::<1>(0, 1),
        );

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(lr, model, grads);

        total_loss += loss.into_scalar().elem::<f64>();
        batches += 1;
    }

    (model, total_loss / batches as f64)
}

fn evaluate<B: Backend>(
    model: &Model<B>,
    loader: &mut GraphLoader<B>,
    criterion: &BinaryCrossEntropyLoss<B>,
) -> (f64, f64) {
    let mut total_loss = 0.0;
    let mut batches = 0;
    let (mut tp, mut predicted_pos, mut actual_pos) = (0i64, 0i64, 0i64);

    for batch in loader.iter() {
        let logits = model.forward(&batch);
        let loss = criterion.forward(
            logits.clone().flatten::<1>(0, 1),
            batch.targets.clone().flatten::<1>(0, 1),
        );
        total_loss += loss.into_scalar().elem::<f64>();
        batches += 1;

        let predictions = sigmoid(logits).greater_equal_elem(0.5).int();
        tp += (predictions.clone() * batch.targets.clone())
            .sum()
            .into_scalar()
            .elem::<i64>();
        predicted_pos += predictions.sum().into_scalar().elem::<i64>();
        actual_pos += batch.targets.sum().into_scalar().elem::<i64>();
    }

    let loss = if batches == 0 {
        0.0
    } else {
        total_loss / batches as f64
    };

    (loss, micro_f1(tp, predicted_pos - tp, actual_pos - tp))
}

/// Evaluates one sampled configuration: trains a fresh model over a
/// freshly shuffled snapshot of the dataset, reporting validation F1 to the
/// pruner after every epoch. Returns `Pruned` when the study cuts the trial
/// short; any `Err` is fatal to the whole search.
pub fn objective<B: AutodiffBackend>(
    trial: &mut Trial<'_>,
    dataset: &PartGraphDataset,
    config: &SearchConfig,
    device: &B::Device,
    sink: &mut dyn RunSink,
) -> Result<TrialOutcome> {
    let params = trial.params().clone();
    info!(trial = trial.number(), ?params, "starting trial");

    let trial_seed = config.seed.wrapping_add(trial.number() as u64);
    B::seed(trial_seed);

    let shuffled = dataset.shuffled(trial_seed);
    let (train_view, val_view) = shuffled.split(config.split_index)?;

    let feature_dim = dataset.feature_dim();
    let class_count = dataset.class_count();

    let batcher = GraphBatcher::<B>::new(device.clone(), feature_dim, class_count);
    let batcher_valid =
        GraphBatcher::<B::InnerBackend>::new(device.clone(), feature_dim, class_count);

    let mut train_loader = GraphLoader::shuffled(
        train_view.clone(),
        batcher,
        params.batch_size,
        StdRng::seed_from_u64(trial_seed),
    );
    let mut train_eval_loader =
        GraphLoader::sequential(train_view, batcher_valid.clone(), params.batch_size);
    let mut val_loader = GraphLoader::sequential(val_view, batcher_valid, params.batch_size);

    if train_loader.batch_count() == 0 || val_loader.batch_count() == 0 {
        return Err(Error::InvalidConfig(format!(
            "batch size {} leaves an empty loader",
            params.batch_size
        )));
    }

    let mut model = ModelConfig::new(
        feature_dim,
        class_count,
        params.conv_layer_count,
        params.hidden_channels,
        params.dropout,
    )
    .init::<B>(device);

    let criterion = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init::<B>(device);
    let criterion_valid = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init::<B::InnerBackend>(device);
    let mut optimizer = AdamConfig::new().init();
    let mut scheduler =
        PlateauScheduler::new(params.learning_rate, SCHEDULER_FACTOR, SCHEDULER_PATIENCE);

    sink.start(trial.number(), &params)?;

    let mut final_val_f1 = 0.0;
    for epoch in 1..config.max_epochs {
        let (trained, training_loss) = train_epoch(
            model,
            &mut train_loader,
            &criterion,
            &mut optimizer,
            scheduler.lr(),
        );
        model = trained;

        let model_valid = model.valid();
        let (_, train_f1) = evaluate(&model_valid, &mut train_eval_loader, &criterion_valid);
        let (val_loss, val_f1) = evaluate(&model_valid, &mut val_loader, &criterion_valid);

        trial.report(epoch, val_f1);
        scheduler.observe(val_f1);

        sink.log_epoch(
            epoch,
            &EpochMetrics {
                training_loss,
                val_loss,
                train_f1,
                val_f1,
            },
        )?;

        if trial.should_prune() {
            sink.finish(None, RunState::Pruned)?;
            return Ok(TrialOutcome::Pruned { epoch });
        }

        info!(epoch, training_loss, val_loss, train_f1, val_f1);
        final_val_f1 = val_f1;
    }

    sink.finish(Some(final_val_f1), RunState::Completed)?;

    fs::create_dir_all(&config.weights_dir)?;
    model.save_file(config.weights_dir.join(WEIGHTS_FILE), &CompactRecorder::new())?;

    Ok(TrialOutcome::Completed {
        score: final_val_f1,
    })
}
