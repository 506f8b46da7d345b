use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use super::{GroupLedger, ParamGroup};
use crate::{
    error::{FtsErr, Result},
    model::{param_names, ParamTree},
};

/// The optimizer collaborator: an ordered, append-only list of parameter groups.
pub trait Optimizer {
    fn param_groups(&self) -> &[ParamGroup];

    fn add_param_group(&mut self, group: ParamGroup);
}

/// A plain in-memory `Optimizer` group list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
}

impl ParamGroups {
    /// Creates a group list holding only the base group.
    pub fn new(base: ParamGroup) -> Self {
        Self { groups: vec![base] }
    }
}

impl Optimizer for ParamGroups {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn add_param_group(&mut self, group: ParamGroup) {
        self.groups.push(group);
    }
}

/// Decides which parameters are exempt from weight decay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecayPolicy {
    no_decay: Vec<String>,
}

impl DecayPolicy {
    /// Creates a new `DecayPolicy`.
    ///
    /// # Arguments
    /// * `no_decay` - Name fragments; any parameter whose name contains one gets no weight decay.
    pub fn new(no_decay: Vec<String>) -> Self {
        Self { no_decay }
    }

    pub fn is_no_decay(&self, param: &str) -> bool {
        self.no_decay.iter().any(|fragment| param.contains(fragment.as_str()))
    }
}

/// What a call to `Synchronizer::add_group` did.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The groups appended to the optimizer, decay group first.
    Added(Vec<ParamGroup>),
    /// There was nothing to thaw, the optimizer is untouched.
    Empty,
}

/// Keeps the optimizer's groups in step with the thawed parameter set.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    policy: DecayPolicy,
    base_max_lr: Option<f64>,
}

impl Synchronizer {
    /// Creates a new `Synchronizer`.
    ///
    /// # Arguments
    /// * `policy` - Splits new parameters into decay and no-decay groups.
    /// * `base_max_lr` - Learning rate for phases without their own; `None` reuses group 0's.
    pub fn new(policy: DecayPolicy, base_max_lr: Option<f64>) -> Self {
        Self {
            policy,
            base_max_lr,
        }
    }

    /// Thaws `delta` and appends one or two optimizer groups for it, recording
    /// them in `ledger`. Either every group is added or none is.
    ///
    /// # Arguments
    /// * `delta` - Newly exposed parameter names.
    /// * `lr_override` - The phase's own learning rate, if it has one.
    ///
    /// # Errors
    /// Returns an error if a parameter is unknown to the model or already
    /// grouped, or if the optimizer has no base group. Nothing is mutated then.
    pub fn add_group(
        &self,
        model: &mut dyn ParamTree,
        optimizer: &mut dyn Optimizer,
        ledger: &mut GroupLedger,
        delta: &[String],
        lr_override: Option<f64>,
    ) -> Result<SyncOutcome> {
        if delta.is_empty() {
            return Ok(SyncOutcome::Empty);
        }

        let groups = self.plan(&*model, &*optimizer, delta, lr_override)?;
        let params: Vec<&str> = delta.iter().map(String::as_str).collect();
        thaw(model, &params)?;

        for group in &groups {
            debug!(
                "adding optimizer group: params={} lr={} weight_decay={}",
                group.params.len(),
                group.lr,
                group.weight_decay
            );
            optimizer.add_param_group(group.clone());
            ledger.record(group.clone());
        }

        Ok(SyncOutcome::Added(groups))
    }

    /// Builds the groups `add_group` would append, without touching anything.
    pub fn plan(
        &self,
        model: &dyn ParamTree,
        optimizer: &dyn Optimizer,
        delta: &[String],
        lr_override: Option<f64>,
    ) -> Result<Vec<ParamGroup>> {
        let live = optimizer.param_groups();
        let base = live.first().ok_or(FtsErr::EmptyOptimizer)?;
        let known: HashSet<String> = param_names(model).into_iter().collect();

        for param in delta {
            if !known.contains(param) {
                return Err(FtsErr::UnknownParameter {
                    name: param.clone(),
                });
            }

            if let Some(group) = live.iter().position(|g| g.contains(param)) {
                return Err(FtsErr::ParamAlreadyGrouped {
                    name: param.clone(),
                    group,
                });
            }
        }

        let lr = lr_override.or(self.base_max_lr).unwrap_or(base.lr);
        let (no_decay, decay): (Vec<String>, Vec<String>) = delta
            .iter()
            .cloned()
            .partition(|param| self.policy.is_no_decay(param));

        let mut groups = Vec::with_capacity(2);
        if !decay.is_empty() {
            groups.push(ParamGroup {
                params: decay,
                lr,
                weight_decay: base.weight_decay,
            });
        }
        if !no_decay.is_empty() {
            groups.push(ParamGroup {
                params: no_decay,
                lr,
                weight_decay: 0.0,
            });
        }

        Ok(groups)
    }

    /// Rebuilds the optimizer's groups from a persisted ledger. The live
    /// groups must be a prefix of `persisted`; the remaining groups are
    /// thawed and appended in their original order.
    ///
    /// # Errors
    /// Returns `FtsErr::LedgerMismatch` if the live groups diverge from the
    /// ledger. Nothing is mutated then.
    pub fn replay(
        &self,
        model: &mut dyn ParamTree,
        optimizer: &mut dyn Optimizer,
        persisted: &GroupLedger,
    ) -> Result<usize> {
        let live = optimizer.param_groups();
        if live.len() > persisted.len() {
            return Err(FtsErr::LedgerMismatch {
                detail: format!(
                    "the optimizer already has {} group(s) but the persisted ledger only {}",
                    live.len(),
                    persisted.len()
                ),
            });
        }

        for (i, (group, stored)) in live.iter().zip(persisted.groups()).enumerate() {
            if !same_members(&group.params, &stored.params) {
                return Err(FtsErr::LedgerMismatch {
                    detail: format!("optimizer group {i} does not hold the persisted parameters"),
                });
            }
        }

        let missing = &persisted.groups()[live.len()..];
        let known: HashSet<String> = param_names(&*model).into_iter().collect();
        let mut pending = HashSet::new();
        for param in missing.iter().flat_map(|group| group.params.iter()) {
            if !known.contains(param) {
                return Err(FtsErr::LedgerMismatch {
                    detail: format!("persisted parameter `{param}` is not part of the model"),
                });
            }
            if live.iter().any(|g| g.contains(param)) || !pending.insert(param.as_str()) {
                return Err(FtsErr::LedgerMismatch {
                    detail: format!("persisted parameter `{param}` is grouped more than once"),
                });
            }
        }

        let params: Vec<&str> = pending.into_iter().collect();
        thaw(model, &params)?;

        for group in missing {
            optimizer.add_param_group(group.clone());
        }

        info!(
            "replayed {} optimizer group(s) from the persisted ledger",
            missing.len()
        );
        Ok(missing.len())
    }
}

fn same_members(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && {
        let a: HashSet<&String> = a.iter().collect();
        b.iter().all(|p| a.contains(p))
    }
}

/// Marks `params` trainable, restoring the previous flags if any update fails.
fn thaw(model: &mut dyn ParamTree, params: &[&str]) -> Result<()> {
    let before: HashMap<String, bool> = model.named_parameters().into_iter().collect();

    for (i, param) in params.iter().enumerate() {
        if let Err(e) = model.set_trainable(param, true) {
            for undo in &params[..i] {
                let flag = before.get(*undo).copied().unwrap_or(false);
                // The original failure is what gets reported.
                if let Err(undo_err) = model.set_trainable(undo, flag) {
                    warn!("could not restore the trainable flag of `{undo}`: {undo_err}");
                }
            }
            return Err(e);
        }
    }

    Ok(())
}
