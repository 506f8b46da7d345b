mod document;
mod infer;
pub mod pattern;
mod validate;

use std::collections::HashSet;

pub use document::{PhaseSpec, RawSchedule, ScheduleDocument};
pub use infer::infer_schedule;
pub use validate::Validator;

use crate::error::{FtsErr, Result};

/// One resolved depth of a `Schedule`.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// The patterns as written, kept for writing the schedule back out.
    pub patterns: Vec<String>,
    /// Every parameter the patterns resolved to, without duplicates.
    pub params: Vec<String>,
    pub lr: Option<f64>,
    pub max_transition_epoch: Option<i64>,
}

impl Phase {
    /// The epoch-count ceiling of this phase, `None` when absent or `-1`.
    pub fn ceiling(&self) -> Option<usize> {
        self.max_transition_epoch
            .and_then(|epoch| usize::try_from(epoch).ok())
    }
}

/// An immutable, validated fine-tuning schedule.
///
/// Depths are contiguous from 0 and phases are pairwise disjoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    phases: Vec<Phase>,
}

impl Schedule {
    /// Builds a schedule from already-validated phases.
    pub(crate) fn from_phases(phases: Vec<Phase>) -> Result<Self> {
        if phases.is_empty() {
            return Err(FtsErr::MalformedSchedule {
                detail: "the schedule defines no phases".into(),
            });
        }

        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, depth: usize) -> Option<&Phase> {
        self.phases.get(depth)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// The deepest depth this schedule defines.
    pub fn max_depth(&self) -> usize {
        self.phases.len() - 1
    }

    /// Returns the depth whose phase owns `param`.
    pub fn depth_of(&self, param: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.params.iter().any(|p| p == param))
    }

    /// Every parameter scheduled at `depth` or shallower.
    pub fn params_through(&self, depth: usize) -> impl Iterator<Item = &str> {
        self.phases
            .iter()
            .take(depth + 1)
            .flat_map(|phase| phase.params.iter().map(String::as_str))
    }

    /// Returns the parameters of `names` that no phase claims.
    pub fn unscheduled<'n>(&self, names: &'n [String]) -> Vec<&'n str> {
        let scheduled: HashSet<&str> = self.params_through(self.max_depth()).collect();
        names
            .iter()
            .map(String::as_str)
            .filter(|name| !scheduled.contains(name))
            .collect()
    }

    /// Checks that every phase but the last carries an epoch ceiling.
    ///
    /// # Errors
    /// Returns `FtsErr::MissingTransitionEpoch` naming the first phase without one.
    pub fn require_ceilings(&self) -> Result<()> {
        let last = self.max_depth();
        match self.phases[..last]
            .iter()
            .position(|phase| phase.ceiling().is_none())
        {
            Some(depth) => Err(FtsErr::MissingTransitionEpoch { depth }),
            None => Ok(()),
        }
    }

    /// Epochs spent before the final phase when every ceiling is honoured.
    pub fn scheduled_epochs(&self) -> usize {
        self.phases[..self.max_depth()]
            .iter()
            .filter_map(Phase::ceiling)
            .map(|ceiling| ceiling + 1)
            .sum()
    }

    /// Converts the schedule back into its written form.
    pub fn to_document(&self) -> ScheduleDocument {
        let mut doc = ScheduleDocument::new();
        for (depth, phase) in self.phases.iter().enumerate() {
            doc.insert(
                depth,
                PhaseSpec {
                    params: phase.patterns.clone(),
                    max_transition_epoch: phase.max_transition_epoch,
                    lr: phase.lr,
                },
            );
        }

        doc
    }
}
