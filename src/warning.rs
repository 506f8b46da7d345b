use std::{fmt, path::PathBuf};

/// Recoverable conditions reported while the run continues.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A phase had no parameters left to thaw.
    EmptyThawDelta { depth: usize },
    /// An early-stopping collaborator is attached in epoch-transitions-only mode.
    RedundantEarlyStopping,
    /// The phase ceilings need more epochs than the loop will run.
    ScheduleExceedsMaxEpochs { scheduled: usize, max_epochs: usize },
    /// Model parameters that no phase claims; they stay frozen.
    UnscheduledParameters { params: Vec<String> },
    /// A transition wanted to restore the best weights before any best checkpoint existed.
    NoBestCheckpoint { depth: usize },
    /// A corrected schedule was written next to a rejected one.
    CorrectedScheduleWritten { path: PathBuf },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyThawDelta { depth } => write!(
                f,
                "no parameters left to thaw at depth {depth}, no new optimizer groups will be added"
            ),
            Self::RedundantEarlyStopping => write!(
                f,
                "epoch_transitions_only is set, the attached early-stopping collaborator is extraneous \
                 and will only end training during the final phase"
            ),
            Self::ScheduleExceedsMaxEpochs {
                scheduled,
                max_epochs,
            } => write!(
                f,
                "the phase ceilings span {scheduled} epochs but max_epochs is {max_epochs}, \
                 training will end before the maximum phase-specified transition epoch"
            ),
            Self::UnscheduledParameters { params } => write!(
                f,
                "{} parameter(s) are not claimed by any phase and will remain frozen: {}",
                params.len(),
                params.join(", ")
            ),
            Self::NoBestCheckpoint { depth } => write!(
                f,
                "no best checkpoint recorded before entering depth {depth}, keeping current weights"
            ),
            Self::CorrectedScheduleWritten { path } => write!(
                f,
                "a corrected schedule candidate was written to {}",
                path.display()
            ),
        }
    }
}
