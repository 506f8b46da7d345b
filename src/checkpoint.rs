use std::collections::BTreeSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FtsErr, Result},
    model::ParamTree,
    optimization::{GroupLedger, ParamGroup},
    schedule::Schedule,
};

/// The checkpoint store collaborator. Saving is driven by the training loop,
/// the scheduler only ever asks for the best weights back.
pub trait CheckpointStore {
    /// Loads the best checkpoint's model weights into `model`, leaving the
    /// optimizer state alone.
    fn restore_best_weights(&mut self, model: &mut dyn ParamTree) -> Result<()>;
}

/// Which depth the best and the latest checkpoint were taken at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDepths {
    pub best_checkpoint_depth: usize,
    pub current_checkpoint_depth: usize,
    /// The group ledger as it was when the best checkpoint was taken.
    pub best_checkpoint_param_groups: Vec<ParamGroup>,
}

impl CheckpointDepths {
    /// Whether a best checkpoint has been recorded yet.
    pub fn has_best(&self) -> bool {
        !self.best_checkpoint_param_groups.is_empty()
    }
}

/// Everything the scheduler persists alongside a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub current_depth: usize,
    pub depth_remaining: usize,
    pub epoch_in_phase: usize,
    pub ft_epoch: usize,
    pub thawed_parameters: BTreeSet<String>,
    pub optimizer_group_metadata: GroupLedger,
    pub checkpoint_metadata: CheckpointDepths,
}

impl EngineState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Keeps the best and current checkpoint depths in step with the run.
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    depths: CheckpointDepths,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts from persisted depths.
    pub fn from_depths(depths: CheckpointDepths) -> Self {
        Self { depths }
    }

    pub fn depths(&self) -> &CheckpointDepths {
        &self.depths
    }

    pub fn has_best(&self) -> bool {
        self.depths.has_best()
    }

    /// Records a checkpoint taken at `depth`.
    ///
    /// # Arguments
    /// * `depth` - The depth active at save time.
    /// * `ledger` - The group ledger at save time.
    /// * `new_best` - Whether the loop declared this checkpoint a new best.
    pub fn on_save(&mut self, depth: usize, ledger: &GroupLedger, new_best: bool) {
        self.depths.current_checkpoint_depth = depth;
        if new_best {
            self.depths.best_checkpoint_depth = depth;
            self.depths.best_checkpoint_param_groups = ledger.groups().to_vec();
            debug!("new best checkpoint at depth {depth}");
        }
    }

    pub fn note_transition(&mut self, depth: usize) {
        self.depths.current_checkpoint_depth = depth;
    }

    /// Reloads the best weights into `model` if a best checkpoint exists.
    ///
    /// # Returns
    /// Whether weights were restored.
    pub fn restore_best(
        &self,
        store: &mut dyn CheckpointStore,
        model: &mut dyn ParamTree,
    ) -> Result<bool> {
        if !self.has_best() {
            return Ok(false);
        }

        store.restore_best_weights(model)?;
        info!(
            "restored best checkpoint weights from depth {}",
            self.depths.best_checkpoint_depth
        );
        Ok(true)
    }
}

/// Checks that persisted `state` can continue under `schedule`.
///
/// # Arguments
/// * `state` - The decoded checkpoint payload.
/// * `schedule` - The schedule of the resuming run.
/// * `max_depth` - The resuming run's effective maximum depth.
///
/// # Errors
/// Returns `FtsErr::ResumeDepthOutOfRange` if the stored depth cannot be
/// reached, or `FtsErr::LedgerMismatch` if the thawed set does not follow
/// from the schedule and the group ledger.
pub fn reconcile(state: &EngineState, schedule: &Schedule, max_depth: usize) -> Result<()> {
    let depth = state.current_depth;
    if depth > max_depth {
        return Err(FtsErr::ResumeDepthOutOfRange {
            depth,
            max: max_depth,
        });
    }

    for (i, group) in state.optimizer_group_metadata.groups().iter().enumerate() {
        if !(group.lr.is_finite() && group.lr >= 0.0) {
            return Err(FtsErr::LedgerMismatch {
                detail: format!("group {i} has an invalid lr {}", group.lr),
            });
        }
    }

    let ledger = &state.optimizer_group_metadata;
    if let Some(param) = schedule
        .params_through(depth)
        .find(|param| !ledger.contains_param(param))
    {
        return Err(FtsErr::LedgerMismatch {
            detail: format!("`{param}` is scheduled through depth {depth} but no group holds it"),
        });
    }

    let expected: BTreeSet<String> = ledger.params().map(str::to_string).collect();

    if let Some(param) = expected.difference(&state.thawed_parameters).next() {
        return Err(FtsErr::LedgerMismatch {
            detail: format!("`{param}` should be thawed at depth {depth} but is not"),
        });
    }
    if let Some(param) = state.thawed_parameters.difference(&expected).next() {
        return Err(FtsErr::LedgerMismatch {
            detail: format!(
                "`{param}` is thawed but neither scheduled through depth {depth} nor grouped"
            ),
        });
    }

    Ok(())
}
