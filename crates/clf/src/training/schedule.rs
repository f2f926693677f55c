//! Per-epoch curriculum for the learning rate, relaxation penalty and
//! controller-loss weight.

use serde::{Deserialize, Serialize};

/// Curriculum hyperparameters. Every quantity is a pure function of the epoch.
///
/// Defaults reproduce the quadrotor run: a constant `1e-3` learning rate, a
/// relaxation penalty doubling every two epochs from 10, and a controller
/// weight shrinking tenfold per epoch from `0.1` down to `1e-5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSchedule {
    pub learning_rate: f64,
    /// Multiplicative decay applied every `learning_rate_decay_period` epochs.
    pub learning_rate_decay: f64,
    pub learning_rate_decay_period: usize,
    pub min_learning_rate: f64,
    pub relaxation_penalty: f64,
    /// Multiplicative growth applied every `relaxation_penalty_period` epochs.
    pub relaxation_penalty_growth: f64,
    pub relaxation_penalty_period: usize,
    /// Optional ceiling on the penalty. Unbounded when `None`.
    pub max_relaxation_penalty: Option<f64>,
    pub controller_loss_coeff: f64,
    /// Multiplicative decay applied every epoch.
    pub controller_loss_decay: f64,
    pub min_controller_loss_coeff: f64,
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            learning_rate_decay: 1.0,
            learning_rate_decay_period: 1,
            min_learning_rate: 1e-4,
            relaxation_penalty: 10.0,
            relaxation_penalty_growth: 2.0,
            relaxation_penalty_period: 2,
            max_relaxation_penalty: None,
            controller_loss_coeff: 0.1,
            controller_loss_decay: 0.1,
            min_controller_loss_coeff: 1e-5,
        }
    }
}

/// Values in force for one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSchedule {
    pub learning_rate: f64,
    pub relaxation_penalty: f64,
    pub controller_loss_coeff: f64,
}

impl TrainingSchedule {
    /// Reject zero periods and non-positive rates.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.learning_rate_decay_period == 0 || self.relaxation_penalty_period == 0 {
            anyhow::bail!("schedule periods must be at least one epoch");
        }
        for (name, value) in [
            ("learning_rate", self.learning_rate),
            ("min_learning_rate", self.min_learning_rate),
            ("learning_rate_decay", self.learning_rate_decay),
            ("relaxation_penalty_growth", self.relaxation_penalty_growth),
            ("controller_loss_decay", self.controller_loss_decay),
        ] {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("schedule {name} must be positive, got {value}");
            }
        }
        for (name, value) in [
            ("relaxation_penalty", self.relaxation_penalty),
            ("controller_loss_coeff", self.controller_loss_coeff),
            ("min_controller_loss_coeff", self.min_controller_loss_coeff),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                anyhow::bail!("schedule {name} must be non-negative, got {value}");
            }
        }
        if let Some(cap) = self.max_relaxation_penalty {
            if cap < self.relaxation_penalty {
                anyhow::bail!(
                    "max_relaxation_penalty {cap} is below the initial penalty {}",
                    self.relaxation_penalty
                );
            }
        }
        Ok(())
    }

    /// Schedule for epoch `epoch` (zero-based).
    pub fn at_epoch(&self, epoch: usize) -> EpochSchedule {
        let lr_steps = (epoch / self.learning_rate_decay_period) as f64;
        let learning_rate = (self.learning_rate * self.learning_rate_decay.powf(lr_steps))
            .max(self.min_learning_rate);

        let penalty_steps = (epoch / self.relaxation_penalty_period) as f64;
        let mut relaxation_penalty =
            self.relaxation_penalty * self.relaxation_penalty_growth.powf(penalty_steps);
        if let Some(cap) = self.max_relaxation_penalty {
            relaxation_penalty = relaxation_penalty.min(cap);
        }

        let controller_loss_coeff = (self.controller_loss_coeff
            * self.controller_loss_decay.powf(epoch as f64))
        .max(self.min_controller_loss_coeff);

        EpochSchedule {
            learning_rate,
            relaxation_penalty,
            controller_loss_coeff,
        }
    }
}
