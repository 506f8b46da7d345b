use log::debug;

/// Why a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The phase reached its `max_transition_epoch`.
    EpochCeiling,
    /// The early-stopping collaborator reported a plateau.
    Plateau,
}

/// The result of evaluating one completed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stay in the current phase.
    Stay,
    /// Move one depth deeper.
    Advance { from: usize, to: usize, trigger: Trigger },
    /// A plateau at the final depth: there is no phase left to move to.
    Exhausted,
}

/// Tracks the current depth of a run and decides phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthTracker {
    max_depth: usize,
    current_depth: usize,
    epoch_in_phase: usize,
    epoch_transitions_only: bool,
}

impl DepthTracker {
    /// Creates a new `DepthTracker` at depth 0.
    ///
    /// # Arguments
    /// * `schedule_max_depth` - The deepest depth the schedule defines.
    /// * `configured_max_depth` - The run-level limit, `-1` (or any negative) for none.
    /// * `epoch_transitions_only` - Ignore plateau signals entirely.
    pub fn new(
        schedule_max_depth: usize,
        configured_max_depth: i64,
        epoch_transitions_only: bool,
    ) -> Self {
        Self {
            max_depth: resolve_max_depth(schedule_max_depth, configured_max_depth),
            current_depth: 0,
            epoch_in_phase: 0,
            epoch_transitions_only,
        }
    }

    pub fn current_depth(&self) -> usize {
        self.current_depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn depth_remaining(&self) -> usize {
        self.max_depth - self.current_depth
    }

    pub fn epoch_in_phase(&self) -> usize {
        self.epoch_in_phase
    }

    pub fn is_terminal(&self) -> bool {
        self.depth_remaining() == 0
    }

    /// Evaluates the transition triggers once a training epoch has completed.
    /// An epoch ceiling wins over a plateau reported on the same epoch.
    ///
    /// # Arguments
    /// * `ceiling` - The active phase's `max_transition_epoch`, if any.
    /// * `plateau` - Whether the early-stopping collaborator reported a plateau.
    pub fn on_epoch_end(&mut self, ceiling: Option<usize>, plateau: bool) -> Step {
        let plateau = plateau && !self.epoch_transitions_only;

        if self.is_terminal() {
            self.epoch_in_phase += 1;
            return if plateau { Step::Exhausted } else { Step::Stay };
        }

        let trigger = match ceiling {
            Some(ceiling) if self.epoch_in_phase >= ceiling => Some(Trigger::EpochCeiling),
            _ if plateau => Some(Trigger::Plateau),
            _ => None,
        };

        let Some(trigger) = trigger else {
            self.epoch_in_phase += 1;
            return Step::Stay;
        };

        let from = self.current_depth;
        self.current_depth += 1;
        self.epoch_in_phase = 0;
        debug!(
            "depth transition {from} -> {} ({trigger:?})",
            self.current_depth
        );

        Step::Advance {
            from,
            to: self.current_depth,
            trigger,
        }
    }

    /// Jumps to a persisted position, clamped at `max_depth`.
    pub fn restore(&mut self, depth: usize, epoch_in_phase: usize) {
        self.current_depth = depth.min(self.max_depth);
        self.epoch_in_phase = epoch_in_phase;
    }
}

/// `min(schedule_max_depth, configured)`, or the schedule's own maximum when
/// `configured` is negative.
pub fn resolve_max_depth(schedule_max_depth: usize, configured: i64) -> usize {
    match usize::try_from(configured) {
        Ok(configured) => configured.min(schedule_max_depth),
        Err(_) => schedule_max_depth,
    }
}
