use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{FtsErr, Result};

/// The early-stopping collaborator as seen by the scheduler.
///
/// On every depth transition the scheduler resets it, so the next phase
/// starts with a fresh patience window.
pub trait PlateauMonitor {
    fn reset(&mut self);
}

/// Whether lower or higher metric values are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

impl Mode {
    /// Whether `a` is strictly better than `b`.
    fn improves(self, a: f64, b: f64) -> bool {
        match self {
            Mode::Min => a < b,
            Mode::Max => a > b,
        }
    }

    fn worst(self) -> f64 {
        match self {
            Mode::Min => f64::INFINITY,
            Mode::Max => f64::NEG_INFINITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Name of the monitored metric, only used in log output.
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    pub mode: Mode,
    pub check_finite: bool,
    pub stopping_threshold: Option<f64>,
    pub divergence_threshold: Option<f64>,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            monitor: "val_loss".into(),
            patience: 3,
            min_delta: 0.0,
            mode: Mode::Min,
            check_finite: true,
            stopping_threshold: None,
            divergence_threshold: None,
        }
    }
}

/// Why `EarlyStopping::update` signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No improvement for `patience` consecutive epochs.
    Plateau,
    NonFinite,
    /// The metric got better than `stopping_threshold`.
    StoppingThreshold,
    /// The metric got worse than `divergence_threshold`.
    DivergenceThreshold,
}

/// Metric-driven plateau detector.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best_score: f64,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    /// Creates a new `EarlyStopping`.
    ///
    /// # Errors
    /// Returns `FtsErr::InvalidConfig` if `min_delta` is negative or NaN.
    pub fn new(config: EarlyStoppingConfig) -> Result<Self> {
        if config.min_delta.is_nan() || config.min_delta < 0.0 {
            return Err(FtsErr::InvalidConfig(format!(
                "min_delta must be a non-negative number, got {}",
                config.min_delta
            )));
        }

        let best_score = config.mode.worst();
        Ok(Self {
            config,
            best_score,
            wait: 0,
            stopped_epoch: None,
        })
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn wait_count(&self) -> usize {
        self.wait
    }

    /// The epoch of the most recent signal.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// Feeds the monitored metric of a completed epoch.
    ///
    /// # Arguments
    /// * `epoch` - The global epoch the value belongs to.
    /// * `value` - The monitored metric.
    ///
    /// # Returns
    /// The reason for stopping, or `None` to keep training.
    pub fn update(&mut self, epoch: usize, value: f64) -> Option<StopReason> {
        let reason = self.evaluate(value);
        if let Some(reason) = reason {
            info!(
                "{} signalled {reason:?} at epoch {epoch} (value {value}, best {})",
                self.config.monitor, self.best_score
            );
            self.stopped_epoch = Some(epoch);
        }

        reason
    }

    fn evaluate(&mut self, value: f64) -> Option<StopReason> {
        let mode = self.config.mode;

        if self.config.check_finite && !value.is_finite() {
            return Some(StopReason::NonFinite);
        }

        if let Some(threshold) = self.config.stopping_threshold {
            if mode.improves(value, threshold) {
                return Some(StopReason::StoppingThreshold);
            }
        }

        if let Some(threshold) = self.config.divergence_threshold {
            if mode.improves(threshold, value) {
                return Some(StopReason::DivergenceThreshold);
            }
        }

        let shifted = match mode {
            Mode::Min => value + self.config.min_delta,
            Mode::Max => value - self.config.min_delta,
        };
        if mode.improves(shifted, self.best_score) {
            self.best_score = value;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        debug!(
            "{} did not improve: wait {}/{}",
            self.config.monitor, self.wait, self.config.patience
        );
        (self.wait >= self.config.patience).then_some(StopReason::Plateau)
    }
}

impl PlateauMonitor for EarlyStopping {
    /// Restarts the patience window. The best score is kept, a new phase has
    /// to beat what earlier phases reached.
    fn reset(&mut self) {
        self.wait = 0;
    }
}
