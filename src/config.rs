use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{FtsErr, Result},
    optimization::DecayPolicy,
};

/// Run-level configuration of a `FinetuningScheduler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    /// A user schedule file. `None` infers one from the model.
    pub ft_schedule: Option<PathBuf>,
    /// Deepest depth the run may reach, `-1` for the schedule's own maximum.
    pub max_depth: i64,
    pub epoch_transitions_only: bool,
    /// Reload the best checkpoint's weights on every depth transition.
    pub restore_best: bool,
    /// Only write the inferred schedule, do not train.
    pub gen_ft_sched_only: bool,
    /// Learning rate of new groups whose phase has none.
    pub base_max_lr: Option<f64>,
    /// Name fragments of parameters that get no weight decay.
    pub no_decay: Vec<String>,
    /// Where generated and corrected schedules are written.
    pub log_dir: Option<PathBuf>,
    /// The loop's epoch budget, if known.
    pub max_epochs: Option<usize>,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            ft_schedule: None,
            max_depth: -1,
            epoch_transitions_only: false,
            restore_best: true,
            gen_ft_sched_only: false,
            base_max_lr: None,
            no_decay: Vec::new(),
            log_dir: None,
            max_epochs: None,
        }
    }
}

impl FtsConfig {
    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that serde alone cannot.
    ///
    /// # Errors
    /// Returns `FtsErr::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_depth < -1 {
            return Err(FtsErr::InvalidConfig(format!(
                "max_depth must be -1 or a depth, got {}",
                self.max_depth
            )));
        }

        if let Some(lr) = self.base_max_lr {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(FtsErr::InvalidConfig(format!(
                    "base_max_lr must be a positive float, got {lr}"
                )));
            }
        }

        if self.max_epochs == Some(0) {
            return Err(FtsErr::InvalidConfig("max_epochs must be at least 1".into()));
        }

        Ok(())
    }

    pub fn decay_policy(&self) -> DecayPolicy {
        DecayPolicy::new(self.no_decay.clone())
    }

    /// Whether plateau signals may trigger transitions.
    pub fn plateau_transitions(&self) -> bool {
        !self.epoch_transitions_only
    }
}
