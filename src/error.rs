use std::{io, path::PathBuf};

use thiserror::Error;

/// The result type used in the entire fine-tuning scheduler.
pub type Result<T> = std::result::Result<T, FtsErr>;

/// Coarse classification of every `FtsErr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-integer, non-contiguous or duplicated depth keys, or an unreadable document.
    ScheduleStructure,
    /// Unresolvable patterns, overlapping phases, invalid or misplaced phase values.
    ScheduleContent,
    /// Run setup problems: missing collaborators, bad config, optimizer misuse.
    Configuration,
    /// Persisted state that cannot be reconciled with the current schedule.
    ResumeConsistency,
    /// Underlying I/O or (de)serialization failures.
    Io,
}

/// The fine-tuning scheduler's error type.
#[derive(Debug, Error)]
pub enum FtsErr {
    #[error("the schedule has non-integer keys, found depth key `{key}`")]
    NonIntegerDepth { key: String },

    #[error("the schedule has non-contiguous or non-zero-indexed keys: {keys:?}")]
    NonContiguousDepths { keys: Vec<i64> },

    #[error("duplicate key: depth {depth} is defined more than once")]
    DuplicateDepth { depth: i64 },

    #[error("malformed schedule document: {detail}")]
    MalformedSchedule { detail: String },

    #[error("malformed phase at depth {depth}: {detail}")]
    MalformedPhase { depth: usize, detail: String },

    #[error("pattern `{pattern}` at depth {depth} did not match any named parameter")]
    UnresolvedPattern { depth: usize, pattern: String },

    #[error(
        "phases are not disjoint: `{param}` at depth {depth} is already scheduled at depth {claimed_by}"
    )]
    OverlappingPhases {
        depth: usize,
        param: String,
        claimed_by: usize,
    },

    #[error("lr `{value}` at depth {depth} is not convertible to a positive float")]
    InvalidLr { depth: usize, value: String },

    #[error("a lr for phase 0 was specified (`{lr}`), depth 0 uses the base optimizer's lr")]
    LrAtDepthZero { lr: String },

    #[error("max_transition_epoch `{value}` at depth {depth} must be an integer >= -1")]
    InvalidTransitionEpoch { depth: usize, value: String },

    #[error("missing required collaborator: {name}")]
    MissingCollaborator { name: &'static str },

    #[error("multiple fine-tuning schedulers attached ({count}), only one is supported")]
    MultipleSchedulers { count: usize },

    #[error("epoch_transitions_only is set but phase {depth} is missing a max_transition_epoch")]
    MissingTransitionEpoch { depth: usize },

    #[error("could not find the schedule file {}", path.display())]
    ScheduleNotFound { path: PathBuf },

    #[error("the optimizer has no base parameter group")]
    EmptyOptimizer,

    #[error("unknown parameter `{name}`")]
    UnknownParameter { name: String },

    #[error("phase 0 parameter `{name}` is not held by any optimizer group")]
    UngroupedPhaseZeroParam { name: String },

    #[error("parameter `{name}` is already managed by optimizer group {group}")]
    ParamAlreadyGrouped { name: String, group: usize },

    #[error("the scheduler has not been started, call on_run_start first")]
    NotStarted,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("resumed depth {depth} exceeds the maximum depth {max}")]
    ResumeDepthOutOfRange { depth: usize, max: usize },

    #[error("persisted state does not match the schedule: {detail}")]
    LedgerMismatch { detail: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FtsErr {
    /// Classifies the error.
    ///
    /// # Returns
    /// The `ErrorKind` family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NonIntegerDepth { .. }
            | Self::NonContiguousDepths { .. }
            | Self::DuplicateDepth { .. }
            | Self::MalformedSchedule { .. } => ErrorKind::ScheduleStructure,
            Self::MalformedPhase { .. }
            | Self::UnresolvedPattern { .. }
            | Self::OverlappingPhases { .. }
            | Self::InvalidLr { .. }
            | Self::LrAtDepthZero { .. }
            | Self::InvalidTransitionEpoch { .. } => ErrorKind::ScheduleContent,
            Self::MissingCollaborator { .. }
            | Self::MultipleSchedulers { .. }
            | Self::MissingTransitionEpoch { .. }
            | Self::ScheduleNotFound { .. }
            | Self::EmptyOptimizer
            | Self::UnknownParameter { .. }
            | Self::UngroupedPhaseZeroParam { .. }
            | Self::ParamAlreadyGrouped { .. }
            | Self::NotStarted
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::ResumeDepthOutOfRange { .. } | Self::LedgerMismatch { .. } => {
                ErrorKind::ResumeConsistency
            }
            Self::Io(_) | Self::Yaml(_) | Self::Json(_) => ErrorKind::Io,
        }
    }

    /// Whether a corrected schedule can be suggested for this failure.
    pub fn is_auto_correctable(&self) -> bool {
        matches!(
            self,
            Self::NonIntegerDepth { .. }
                | Self::NonContiguousDepths { .. }
                | Self::DuplicateDepth { .. }
                | Self::UnresolvedPattern { .. }
        )
    }
}
