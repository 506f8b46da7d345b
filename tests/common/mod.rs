#![allow(dead_code)]

use finetuning_scheduler::{
    CheckpointStore, Collaborators, EarlyStopping, EarlyStoppingConfig, EngineState,
    EpochDecision, FinetuningScheduler, FtsConfig, NamedParams, Outcome, ParamGroup, ParamGroups,
    ParamTree, PlateauMonitor, Result,
};

pub const BASE_LR: f64 = 1e-3;
pub const BASE_WD: f64 = 1e-6;

/// A loss curve that bottoms out at epoch 3 and then keeps rising.
pub const INTRAFIT_LOSSES: [f64; 9] = [1.0, 0.9, 0.8, 0.7, 0.8, 0.9, 1.0, 1.1, 1.2];

/// Four linear layers, `layer.0` closest to the input.
pub fn boring_model() -> NamedParams {
    NamedParams::new(
        "BoringModel",
        (0..4).flat_map(|i| [format!("layer.{i}.weight"), format!("layer.{i}.bias")]),
    )
}

pub fn config() -> FtsConfig {
    FtsConfig::default()
}

/// Counts how often the best weights were requested.
#[derive(Debug, Default)]
pub struct BestWeights {
    pub restores: usize,
}

impl CheckpointStore for BestWeights {
    fn restore_best_weights(&mut self, _model: &mut dyn ParamTree) -> Result<()> {
        self.restores += 1;
        Ok(())
    }
}

/// A plateau monitor fed with precomputed signals.
#[derive(Debug, Default)]
pub struct Scripted {
    pub resets: usize,
}

impl PlateauMonitor for Scripted {
    fn reset(&mut self) {
        self.resets += 1;
    }
}

/// The depth, remaining depth, epoch, ledger size and thawed count seen at an epoch start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStart {
    pub depth: usize,
    pub depth_remaining: usize,
    pub ft_epoch: usize,
    pub groups: usize,
    pub thawed: usize,
}

/// A single training run's collaborators, driven like a training loop would.
pub struct Harness {
    pub model: NamedParams,
    pub optimizer: ParamGroups,
    pub store: BestWeights,
    pub early_stopping: EarlyStopping,
    pub starts: Vec<EpochStart>,
    pub decisions: Vec<EpochDecision>,
    /// Checkpoint payloads, one per epoch.
    pub payloads: Vec<Vec<u8>>,
    best_loss: f64,
}

impl Harness {
    pub fn new(model: NamedParams, patience: usize) -> Self {
        let early_stopping = EarlyStopping::new(EarlyStoppingConfig {
            patience,
            ..Default::default()
        })
        .unwrap();

        Self {
            model,
            optimizer: ParamGroups::default(),
            store: BestWeights::default(),
            early_stopping,
            starts: Vec::new(),
            decisions: Vec::new(),
            payloads: Vec::new(),
            best_loss: f64::INFINITY,
        }
    }

    /// Builds the base optimizer group from the scheduler's phase 0.
    pub fn seed_optimizer(&mut self, fts: &mut FinetuningScheduler) {
        let phase0 = fts.resolve_schedule(&self.model).unwrap().phases()[0]
            .params
            .clone();
        self.optimizer = ParamGroups::new(ParamGroup::new(phase0, BASE_LR, BASE_WD));
    }

    pub fn start(&mut self, fts: &mut FinetuningScheduler) -> Result<Outcome> {
        let mut c = Collaborators::new(&mut self.model, &mut self.optimizer)
            .with_checkpoints(&mut self.store)
            .with_early_stopping(&mut self.early_stopping);
        fts.on_run_start(&mut c)
    }

    /// Runs one epoch per loss value until the scheduler says stop.
    pub fn fit(&mut self, fts: &mut FinetuningScheduler, losses: &[f64]) -> Result<()> {
        for (epoch, &loss) in losses.iter().enumerate() {
            fts.on_epoch_start()?;
            let start = self.snapshot(fts);
            self.starts.push(start);

            let plateau = self.early_stopping.update(epoch, loss).is_some();
            let new_best = loss < self.best_loss;
            if new_best {
                self.best_loss = loss;
            }
            self.payloads.push(fts.on_checkpoint_save(new_best)?);

            let mut c = Collaborators::new(&mut self.model, &mut self.optimizer)
                .with_checkpoints(&mut self.store)
                .with_early_stopping(&mut self.early_stopping);
            let decision = fts.on_epoch_end(&mut c, plateau)?;
            let stop = decision == EpochDecision::Stop;
            self.decisions.push(decision);
            if stop {
                break;
            }
        }

        Ok(())
    }

    fn snapshot(&self, fts: &FinetuningScheduler) -> EpochStart {
        EpochStart {
            depth: fts.current_depth(),
            depth_remaining: fts.depth_remaining(),
            ft_epoch: fts.ft_epoch(),
            groups: fts.ledger().len(),
            thawed: fts.thawed_parameters().len(),
        }
    }
}

/// Indices of the epochs whose end produced a transition.
pub fn transition_epochs(decisions: &[EpochDecision]) -> Vec<usize> {
    decisions
        .iter()
        .enumerate()
        .filter(|(_, d)| matches!(d, EpochDecision::Transitioned(_)))
        .map(|(epoch, _)| epoch)
        .collect()
}

/// Drives a scheduler with scripted plateau signals and no checkpoint store.
pub fn scripted_run(
    fts: &mut FinetuningScheduler,
    model: &mut NamedParams,
    optimizer: &mut ParamGroups,
    plateaus: &[bool],
    mut on_epoch: impl FnMut(&FinetuningScheduler, &NamedParams),
) -> Result<Vec<EpochDecision>> {
    let mut monitor = Scripted::default();
    let mut decisions = Vec::with_capacity(plateaus.len());

    for &plateau in plateaus {
        fts.on_epoch_start()?;
        let mut c = Collaborators::new(&mut *model, &mut *optimizer)
            .with_early_stopping(&mut monitor);
        let decision = fts.on_epoch_end(&mut c, plateau)?;
        on_epoch(fts, model);

        let stop = decision == EpochDecision::Stop;
        decisions.push(decision);
        if stop {
            break;
        }
    }

    Ok(decisions)
}

pub fn decode(payload: &[u8]) -> EngineState {
    EngineState::from_bytes(payload).unwrap()
}
