pub mod checkpoint;
pub mod config;
pub mod depth;
pub mod engine;
pub mod error;
pub mod model;
pub mod optimization;
pub mod plateau;
pub mod schedule;
pub mod warning;

pub use checkpoint::{CheckpointDepths, CheckpointStore, EngineState};
pub use config::FtsConfig;
pub use depth::{DepthTracker, Trigger};
pub use engine::{Collaborators, EpochDecision, FinetuningScheduler, Outcome, Transition};
pub use error::{ErrorKind, FtsErr, Result};
pub use model::{NamedParams, ParamTree};
pub use optimization::{GroupLedger, Optimizer, ParamGroup, ParamGroups};
pub use plateau::{EarlyStopping, EarlyStoppingConfig, Mode, PlateauMonitor, StopReason};
pub use schedule::{infer_schedule, Phase, PhaseSpec, Schedule, ScheduleDocument};
pub use warning::Warning;
