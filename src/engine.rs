use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointDepths, CheckpointStore, Coordinator, EngineState},
    config::FtsConfig,
    depth::{DepthTracker, Step, Trigger},
    error::{FtsErr, Result},
    model::{param_names, ParamTree},
    optimization::{GroupLedger, Optimizer, SyncOutcome, Synchronizer},
    plateau::PlateauMonitor,
    schedule::{infer_schedule, RawSchedule, Schedule, ScheduleDocument, Validator},
    warning::Warning,
};

/// The collaborators handed to the scheduler on every lifecycle callback.
pub struct Collaborators<'a> {
    pub model: &'a mut dyn ParamTree,
    pub optimizer: &'a mut dyn Optimizer,
    pub checkpoints: Option<&'a mut dyn CheckpointStore>,
    pub early_stopping: Option<&'a mut dyn PlateauMonitor>,
    /// Other fine-tuning schedulers attached to the same loop.
    pub peer_schedulers: usize,
}

impl<'a> Collaborators<'a> {
    pub fn new(model: &'a mut dyn ParamTree, optimizer: &'a mut dyn Optimizer) -> Self {
        Self {
            model,
            optimizer,
            checkpoints: None,
            early_stopping: None,
            peer_schedulers: 0,
        }
    }

    pub fn with_checkpoints(mut self, store: &'a mut dyn CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_early_stopping(mut self, monitor: &'a mut dyn PlateauMonitor) -> Self {
        self.early_stopping = Some(monitor);
        self
    }

    pub fn with_peer_schedulers(mut self, count: usize) -> Self {
        self.peer_schedulers = count;
        self
    }
}

/// What run setup decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Training may start.
    Proceed,
    /// The schedule was written and no training should happen.
    ScheduleWrittenOnly { path: PathBuf },
}

/// A completed depth transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    pub trigger: Trigger,
    /// The parameters thawed by this transition.
    pub thawed: Vec<String>,
    pub groups_added: usize,
}

/// What the loop should do after an epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochDecision {
    Continue,
    Transitioned(Transition),
    /// A plateau at the final depth, the run should end.
    Stop,
}

/// Gradually unfreezes a model by following a depth-indexed schedule.
///
/// The training loop drives it through `on_run_start`, then
/// `on_epoch_start`/`on_epoch_end` once per epoch. Checkpoints taken during an
/// epoch must be reported through `on_checkpoint_save` before that epoch's
/// `on_epoch_end`, so transitions always see the latest checkpoint depths.
pub struct FinetuningScheduler {
    config: FtsConfig,
    document: Option<ScheduleDocument>,
    schedule: Option<Schedule>,
    generated: Option<PathBuf>,
    synchronizer: Synchronizer,
    tracker: Option<DepthTracker>,
    coordinator: Coordinator,
    thawed: BTreeSet<String>,
    ledger: GroupLedger,
    ft_epoch: usize,
    warnings: Vec<Warning>,
}

impl FinetuningScheduler {
    /// Creates a new `FinetuningScheduler`.
    ///
    /// # Arguments
    /// * `config` - The run configuration, validated on `on_run_start`.
    ///
    /// # Returns
    /// A scheduler that has not started yet.
    pub fn new(config: FtsConfig) -> Self {
        let synchronizer = Synchronizer::new(config.decay_policy(), config.base_max_lr);

        Self {
            config,
            document: None,
            schedule: None,
            generated: None,
            synchronizer,
            tracker: None,
            coordinator: Coordinator::new(),
            thawed: BTreeSet::new(),
            ledger: GroupLedger::default(),
            ft_epoch: 0,
            warnings: Vec::new(),
        }
    }

    /// Uses an in-memory schedule instead of `ft_schedule` or inference.
    pub fn with_schedule(mut self, document: ScheduleDocument) -> Self {
        self.document = Some(document);
        self
    }

    /// Resolves the schedule for `model` once: the in-memory document, the
    /// `ft_schedule` file, or an inferred schedule, in that order of preference.
    ///
    /// Callers that build the optimizer's base group from phase 0 call this
    /// before `on_run_start`.
    ///
    /// # Errors
    /// Returns the first validation failure. Auto-correctable failures also
    /// leave a corrected schedule on disk when a directory is available.
    pub fn resolve_schedule(&mut self, model: &dyn ParamTree) -> Result<&Schedule> {
        if self.schedule.is_none() {
            let schedule = self.load_schedule(model)?;
            self.schedule = Some(schedule);
        }

        self.schedule.as_ref().ok_or(FtsErr::NotStarted)
    }

    fn load_schedule(&mut self, model: &dyn ParamTree) -> Result<Schedule> {
        let names = param_names(model);

        if let Some(document) = &self.document {
            let raw = RawSchedule::from_document(document)?;
            let dir = self.config.log_dir.clone();
            let schedule = self.validate_raw(&raw, &names, model.name(), dir.as_deref())?;
            self.check_coverage(&schedule, &names);
            return Ok(schedule);
        }

        if let Some(path) = self.config.ft_schedule.clone() {
            let raw = RawSchedule::load(&path)?;
            let dir = self
                .config
                .log_dir
                .clone()
                .or_else(|| path.parent().map(Path::to_path_buf));
            let schedule = self.validate_raw(&raw, &names, model.name(), dir.as_deref())?;
            info!(
                "loaded a {}-phase schedule from {}",
                schedule.len(),
                path.display()
            );
            self.check_coverage(&schedule, &names);
            return Ok(schedule);
        }

        let schedule = infer_schedule(model)?;
        info!(model = model.name(); "inferred a {}-phase schedule", schedule.len());
        if let Some(dir) = self.generated_dir() {
            let path = dir.join(format!("{}_ft_schedule.yaml", model.name()));
            schedule.to_document().write(&path)?;
            info!("wrote the generated schedule to {}", path.display());
            self.generated = Some(path);
        }

        Ok(schedule)
    }

    fn generated_dir(&self) -> Option<PathBuf> {
        match &self.config.log_dir {
            Some(dir) => Some(dir.clone()),
            None if self.config.gen_ft_sched_only => Some(PathBuf::from(".")),
            None => None,
        }
    }

    fn validate_raw(
        &mut self,
        raw: &RawSchedule,
        names: &[String],
        model_name: &str,
        correction_dir: Option<&Path>,
    ) -> Result<Schedule> {
        let validator = Validator::new(names);
        let err = match validator.validate(raw) {
            Ok(schedule) => return Ok(schedule),
            Err(err) => err,
        };

        if !err.is_auto_correctable() {
            return Err(err);
        }

        if let (Some(dir), Some(corrected)) = (correction_dir, validator.correct(raw)) {
            let path = dir.join(format!("{model_name}_ft_schedule_valid.yaml"));
            match corrected.write(&path) {
                Ok(()) => self.warn(Warning::CorrectedScheduleWritten { path }),
                Err(write_err) => warn!("could not write a corrected schedule: {write_err}"),
            }
        }

        Err(err)
    }

    fn check_coverage(&mut self, schedule: &Schedule, names: &[String]) {
        let unscheduled = schedule.unscheduled(names);
        if !unscheduled.is_empty() {
            let params = unscheduled.into_iter().map(str::to_string).collect();
            self.warn(Warning::UnscheduledParameters { params });
        }
    }

    /// Prepares a run: resolves the schedule, checks the collaborators, freezes
    /// every parameter outside phase 0 and the optimizer's existing groups, and
    /// seeds the group ledger from the optimizer.
    ///
    /// # Returns
    /// `Outcome::ScheduleWrittenOnly` when only a schedule was requested.
    ///
    /// # Errors
    /// Returns a configuration or schedule error. No collaborator is mutated then.
    pub fn on_run_start(&mut self, c: &mut Collaborators) -> Result<Outcome> {
        self.config.validate()?;

        if c.peer_schedulers > 0 {
            return Err(FtsErr::MultipleSchedulers {
                count: c.peer_schedulers + 1,
            });
        }

        let schedule = self.resolve_schedule(&*c.model)?.clone();

        if self.config.gen_ft_sched_only {
            let path = match self.generated.clone() {
                Some(path) => path,
                None => {
                    let dir = self.generated_dir().unwrap_or_else(|| PathBuf::from("."));
                    let path = dir.join(format!("{}_ft_schedule.yaml", c.model.name()));
                    schedule.to_document().write(&path)?;
                    path
                }
            };
            info!("schedule written to {}, not training", path.display());
            return Ok(Outcome::ScheduleWrittenOnly { path });
        }

        if !self.config.plateau_transitions() {
            schedule.require_ceilings()?;
            if c.early_stopping.is_some() {
                self.warn(Warning::RedundantEarlyStopping);
            }
            if let Some(max_epochs) = self.config.max_epochs {
                let scheduled = schedule.scheduled_epochs();
                if scheduled > max_epochs {
                    self.warn(Warning::ScheduleExceedsMaxEpochs {
                        scheduled,
                        max_epochs,
                    });
                }
            }
        } else if c.early_stopping.is_none() {
            return Err(FtsErr::MissingCollaborator {
                name: "early_stopping",
            });
        }

        if self.config.restore_best && c.checkpoints.is_none() {
            return Err(FtsErr::MissingCollaborator {
                name: "checkpoint_store",
            });
        }

        let groups = c.optimizer.param_groups();
        if groups.is_empty() {
            return Err(FtsErr::EmptyOptimizer);
        }

        let names = param_names(&*c.model);
        let known: HashSet<&str> = names.iter().map(String::as_str).collect();
        if let Some(unknown) = groups
            .iter()
            .flat_map(|group| group.params.iter())
            .find(|param| !known.contains(param.as_str()))
        {
            return Err(FtsErr::UnknownParameter {
                name: unknown.clone(),
            });
        }

        // Phase 0 trains from the first epoch, so the optimizer must already hold it.
        if let Some(ungrouped) = schedule
            .params_through(0)
            .find(|param| !groups.iter().any(|group| group.contains(param)))
        {
            return Err(FtsErr::UngroupedPhaseZeroParam {
                name: ungrouped.to_string(),
            });
        }

        let mut thawed: BTreeSet<String> = schedule.params_through(0).map(str::to_string).collect();
        thawed.extend(groups.iter().flat_map(|group| group.params.iter().cloned()));

        for name in &names {
            c.model.set_trainable(name, thawed.contains(name))?;
        }

        let tracker = DepthTracker::new(
            schedule.max_depth(),
            self.config.max_depth,
            self.config.epoch_transitions_only,
        );
        info!(
            "starting fine-tuning at depth 0 of {} with {} thawed parameter(s)",
            tracker.max_depth(),
            thawed.len()
        );

        self.ledger = GroupLedger::from_groups(groups);
        self.thawed = thawed;
        self.tracker = Some(tracker);
        self.coordinator = Coordinator::new();
        self.ft_epoch = 0;

        Ok(Outcome::Proceed)
    }

    /// Marks the start of an epoch.
    ///
    /// # Returns
    /// The depth the epoch trains at.
    pub fn on_epoch_start(&self) -> Result<usize> {
        let tracker = self.tracker.as_ref().ok_or(FtsErr::NotStarted)?;
        debug!(
            "epoch {} starts at depth {} (epoch {} of the phase)",
            self.ft_epoch,
            tracker.current_depth(),
            tracker.epoch_in_phase()
        );

        Ok(tracker.current_depth())
    }

    /// Evaluates the transition triggers of a completed epoch and, on a
    /// transition, thaws the next phase and adds its optimizer groups.
    ///
    /// # Arguments
    /// * `plateau` - Whether the early-stopping collaborator reported a plateau.
    ///
    /// # Errors
    /// Returns an error if restoring the best weights or adding the groups
    /// fails. The engine state is left as it was before the call then.
    pub fn on_epoch_end(&mut self, c: &mut Collaborators, plateau: bool) -> Result<EpochDecision> {
        let schedule = self.schedule.as_ref().ok_or(FtsErr::NotStarted)?;
        let mut tracker = self.tracker.clone().ok_or(FtsErr::NotStarted)?;

        let ceiling = schedule
            .phase(tracker.current_depth())
            .and_then(|phase| phase.ceiling());

        let (from, to, trigger) = match tracker.on_epoch_end(ceiling, plateau) {
            Step::Stay => {
                self.tracker = Some(tracker);
                self.ft_epoch += 1;
                return Ok(EpochDecision::Continue);
            }
            Step::Exhausted => {
                info!("plateau at the final depth {}, stopping", tracker.current_depth());
                self.tracker = Some(tracker);
                self.ft_epoch += 1;
                return Ok(EpochDecision::Stop);
            }
            Step::Advance { from, to, trigger } => (from, to, trigger),
        };

        let phase = schedule.phase(to).ok_or(FtsErr::NotStarted)?;
        let delta: Vec<String> = phase
            .params
            .iter()
            .filter(|param| !self.ledger.contains_param(param))
            .cloned()
            .collect();
        let lr = phase.lr;

        let mut missing_best = false;
        if self.config.restore_best {
            let store = c.checkpoints.as_deref_mut().ok_or(FtsErr::MissingCollaborator {
                name: "checkpoint_store",
            })?;
            missing_best = !self.coordinator.restore_best(store, &mut *c.model)?;
        }

        let mut ledger = self.ledger.clone();
        let outcome =
            self.synchronizer
                .add_group(&mut *c.model, &mut *c.optimizer, &mut ledger, &delta, lr)?;

        let groups_added = match outcome {
            SyncOutcome::Added(groups) => groups.len(),
            SyncOutcome::Empty => 0,
        };

        self.ledger = ledger;
        self.thawed.extend(delta.iter().cloned());
        self.tracker = Some(tracker);
        self.coordinator.note_transition(to);
        self.ft_epoch += 1;

        if let Some(monitor) = c.early_stopping.as_deref_mut() {
            monitor.reset();
        }
        if missing_best {
            self.warn(Warning::NoBestCheckpoint { depth: to });
        }
        if groups_added == 0 {
            self.warn(Warning::EmptyThawDelta { depth: to });
        }

        info!(
            depth = to;
            "transitioned from depth {from} ({trigger:?}), thawed {} parameter(s) in {groups_added} new group(s)",
            delta.len()
        );

        Ok(EpochDecision::Transitioned(Transition {
            from,
            to,
            trigger,
            thawed: delta,
            groups_added,
        }))
    }

    /// Records a checkpoint taken at the current depth.
    ///
    /// # Arguments
    /// * `new_best` - Whether the loop declared this checkpoint a new best.
    ///
    /// # Returns
    /// The serialized `EngineState` to store with the checkpoint.
    pub fn on_checkpoint_save(&mut self, new_best: bool) -> Result<Vec<u8>> {
        let depth = self
            .tracker
            .as_ref()
            .ok_or(FtsErr::NotStarted)?
            .current_depth();
        self.coordinator.on_save(depth, &self.ledger, new_best);

        self.state().ok_or(FtsErr::NotStarted)?.to_bytes()
    }

    /// Resumes from a checkpoint payload produced by `on_checkpoint_save`.
    /// Must follow `on_run_start` of the resuming run.
    ///
    /// The persisted group ledger is replayed onto the optimizer in its
    /// original order, so optimizer state lines up with parameter identity.
    ///
    /// # Errors
    /// Returns a resume-consistency error if the payload cannot continue under
    /// the current schedule and configuration. Nothing is mutated then.
    pub fn on_checkpoint_load(&mut self, c: &mut Collaborators, payload: &[u8]) -> Result<()> {
        let schedule = self.schedule.as_ref().ok_or(FtsErr::NotStarted)?;
        let mut tracker = self.tracker.clone().ok_or(FtsErr::NotStarted)?;

        let state = EngineState::from_bytes(payload)?;
        checkpoint::reconcile(&state, schedule, tracker.max_depth())?;

        let replayed = self.synchronizer.replay(
            &mut *c.model,
            &mut *c.optimizer,
            &state.optimizer_group_metadata,
        )?;
        for param in &state.thawed_parameters {
            c.model.set_trainable(param, true)?;
        }

        tracker.restore(state.current_depth, state.epoch_in_phase);
        if tracker.depth_remaining() != state.depth_remaining {
            debug!(
                "persisted depth_remaining {} recomputed as {} for max depth {}",
                state.depth_remaining,
                tracker.depth_remaining(),
                tracker.max_depth()
            );
        }

        info!(
            depth = state.current_depth;
            "resumed at epoch {} with {} thawed parameter(s), replayed {replayed} group(s)",
            state.ft_epoch,
            state.thawed_parameters.len()
        );

        self.tracker = Some(tracker);
        self.thawed = state.thawed_parameters;
        self.ledger = state.optimizer_group_metadata;
        self.ft_epoch = state.ft_epoch;
        self.coordinator = Coordinator::from_depths(state.checkpoint_metadata);

        Ok(())
    }

    fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn config(&self) -> &FtsConfig {
        &self.config
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.tracker.is_some()
    }

    /// A snapshot of the persisted state, `None` before `on_run_start`.
    pub fn state(&self) -> Option<EngineState> {
        let tracker = self.tracker.as_ref()?;

        Some(EngineState {
            current_depth: tracker.current_depth(),
            depth_remaining: tracker.depth_remaining(),
            epoch_in_phase: tracker.epoch_in_phase(),
            ft_epoch: self.ft_epoch,
            thawed_parameters: self.thawed.clone(),
            optimizer_group_metadata: self.ledger.clone(),
            checkpoint_metadata: self.coordinator.depths().clone(),
        })
    }

    pub fn current_depth(&self) -> usize {
        self.tracker.as_ref().map_or(0, DepthTracker::current_depth)
    }

    pub fn depth_remaining(&self) -> usize {
        self.tracker.as_ref().map_or(0, DepthTracker::depth_remaining)
    }

    pub fn max_depth(&self) -> usize {
        self.tracker.as_ref().map_or(0, DepthTracker::max_depth)
    }

    pub fn epoch_in_phase(&self) -> usize {
        self.tracker.as_ref().map_or(0, DepthTracker::epoch_in_phase)
    }

    /// Epochs completed since the run started, across all phases.
    pub fn ft_epoch(&self) -> usize {
        self.ft_epoch
    }

    pub fn thawed_parameters(&self) -> &BTreeSet<String> {
        &self.thawed
    }

    pub fn ledger(&self) -> &GroupLedger {
        &self.ledger
    }

    pub fn checkpoint_depths(&self) -> &CheckpointDepths {
        self.coordinator.depths()
    }
}
