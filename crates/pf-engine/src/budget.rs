//! Stopping criteria and build-wide settings.
//!
//! Budgets never touch the dispatcher. The feeder consults
//! [`StoppingCriteria::should_stop`] each time it decides whether to submit
//! another job.

use chrono::Utc;
use pf_types::{AlgoParameters, DatasetHandle, StoppingMetric};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentinel tolerance: derive the tolerance from the training frame.
pub const AUTO_STOPPING_TOLERANCE: f64 = -1.0;

/// Why submission of new jobs stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxModels,
    MaxRuntime,
    EarlyStopping,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::MaxModels => write!(f, "max models reached"),
            StopReason::MaxRuntime => write!(f, "max runtime reached"),
            StopReason::EarlyStopping => write!(f, "no improvement in stopping window"),
        }
    }
}

/// Model-count, wall-clock, and early-stopping limits. Zero means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingCriteria {
    pub seed: i64,
    pub max_models: u32,
    pub max_runtime_secs: f64,
    pub max_runtime_secs_per_model: f64,
    pub stopping_rounds: u32,
    /// Relative improvement threshold, or [`AUTO_STOPPING_TOLERANCE`].
    pub stopping_tolerance: f64,
    pub stopping_metric: StoppingMetric,
}

impl Default for StoppingCriteria {
    fn default() -> Self {
        Self {
            seed: -1,
            max_models: 0,
            max_runtime_secs: 0.0,
            max_runtime_secs_per_model: 0.0,
            stopping_rounds: 0,
            stopping_tolerance: 0.001,
            stopping_metric: StoppingMetric::Auto,
        }
    }
}

impl StoppingCriteria {
    pub fn with_max_models(mut self, n: u32) -> Self {
        self.max_models = n;
        self
    }

    pub fn with_max_runtime_secs(mut self, secs: f64) -> Self {
        self.max_runtime_secs = secs;
        self
    }

    pub fn with_max_runtime_secs_per_model(mut self, secs: f64) -> Self {
        self.max_runtime_secs_per_model = secs;
        self
    }

    pub fn with_early_stopping(mut self, rounds: u32, tolerance: f64, metric: StoppingMetric) -> Self {
        self.stopping_rounds = rounds;
        self.stopping_tolerance = tolerance;
        self.stopping_metric = metric;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// `1 / sqrt(rows * non_na_rate)`, clamped to `[0.001, 0.05]`.
    pub fn default_stopping_tolerance_for(dataset: &DatasetHandle) -> f64 {
        let effective_rows = dataset.rows as f64 * dataset.non_na_rate;
        if effective_rows <= 0.0 {
            return 0.05;
        }
        (1.0 / effective_rows.sqrt()).clamp(0.001, 0.05)
    }

    pub fn set_default_stopping_tolerance_for(&mut self, dataset: &DatasetHandle) {
        self.stopping_tolerance = Self::default_stopping_tolerance_for(dataset);
    }

    /// Resolve the sentinel if it is still set.
    pub fn resolve_tolerance(&mut self, dataset: &DatasetHandle) {
        if self.stopping_tolerance == AUTO_STOPPING_TOLERANCE {
            self.set_default_stopping_tolerance_for(dataset);
        }
    }

    /// Positive seconds as a duration, saturating past `Duration::MAX`.
    fn limit(secs: f64) -> Option<Duration> {
        if secs > 0.0 {
            Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        } else {
            None
        }
    }

    /// Time left in the overall budget; `None` when unbounded.
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        Self::limit(self.max_runtime_secs).map(|total| total.saturating_sub(elapsed))
    }

    /// Ceiling for a job started now: the per-model limit clipped to what is
    /// left of the overall budget.
    pub fn per_model_runtime(&self, elapsed: Duration) -> Option<Duration> {
        match (Self::limit(self.max_runtime_secs_per_model), self.remaining(elapsed)) {
            (Some(per_model), Some(remaining)) => Some(per_model.min(remaining)),
            (per_model, remaining) => per_model.or(remaining),
        }
    }

    /// Decide whether new jobs may still be submitted.
    ///
    /// `models_started` counts jobs already launched for distinct
    /// configurations; `scores` holds finished models' scores in completion
    /// order.
    pub fn should_stop(
        &self,
        elapsed: Duration,
        models_started: usize,
        scores: &[f64],
    ) -> Option<StopReason> {
        if self.max_models > 0 && models_started >= self.max_models as usize {
            return Some(StopReason::MaxModels);
        }
        if let Some(remaining) = self.remaining(elapsed) {
            if remaining.is_zero() {
                return Some(StopReason::MaxRuntime);
            }
        }
        if self.stalled(scores) {
            return Some(StopReason::EarlyStopping);
        }
        None
    }

    /// True when the best of the last `k` scores does not improve on the
    /// mean of the `k` before them by at least the tolerance.
    fn stalled(&self, scores: &[f64]) -> bool {
        let k = self.stopping_rounds as usize;
        if k == 0 || scores.len() < 2 * k || self.stopping_tolerance < 0.0 {
            return false;
        }

        let n = scores.len();
        let reference = scores[n - 2 * k..n - k].iter().sum::<f64>() / k as f64;
        let recent = &scores[n - k..];
        let higher_is_better = self.stopping_metric.is_higher_better();
        let best = if higher_is_better {
            recent.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        } else {
            recent.iter().copied().fold(f64::INFINITY, f64::min)
        };

        let gain = if higher_is_better {
            best - reference
        } else {
            reference - best
        };
        let relative = if reference.abs() > f64::EPSILON {
            gain / reference.abs()
        } else {
            gain
        };
        relative < self.stopping_tolerance
    }
}

/// Build-wide settings passed through to every algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildControl {
    pub stopping_criteria: StoppingCriteria,
    /// Groups models of one project together.
    pub project_name: Option<String>,
    pub balance_classes: bool,
    pub class_sampling_factors: Option<Vec<f32>>,
    pub max_after_balance_size: f32,
    pub nfolds: u32,
    pub keep_cross_validation_predictions: bool,
    pub keep_cross_validation_models: bool,
    pub keep_cross_validation_fold_assignment: bool,
    pub export_checkpoints_dir: Option<String>,
}

impl Default for BuildControl {
    fn default() -> Self {
        Self {
            stopping_criteria: StoppingCriteria::default()
                .with_max_models(0)
                .with_max_runtime_secs(3600.0)
                .with_max_runtime_secs_per_model(0.0)
                .with_early_stopping(3, 0.001, StoppingMetric::Auto),
            project_name: None,
            balance_classes: false,
            class_sampling_factors: None,
            max_after_balance_size: 5.0,
            nfolds: 5,
            keep_cross_validation_predictions: false,
            keep_cross_validation_models: false,
            keep_cross_validation_fold_assignment: false,
            export_checkpoints_dir: None,
        }
    }
}

impl BuildControl {
    /// Project name, generated from the current time on first use.
    pub fn project(&mut self) -> &str {
        self.project_name
            .get_or_insert_with(|| format!("AutoML_{}", Utc::now().format("%Y%m%d_%-H%M%S%3f")))
    }

    /// Copy the pass-through settings into an algorithm's parameters.
    pub fn apply_to(&self, params: &mut AlgoParameters) {
        let criteria = &self.stopping_criteria;
        let common = params.common_mut();
        common.seed = criteria.seed;
        common.nfolds = self.nfolds;
        common.balance_classes = self.balance_classes;
        common.max_after_balance_size = f64::from(self.max_after_balance_size);
        common.keep_cross_validation_predictions = self.keep_cross_validation_predictions;
        common.keep_cross_validation_models = self.keep_cross_validation_models;
        common.stopping_rounds = criteria.stopping_rounds;
        common.stopping_metric = criteria.stopping_metric;
        if criteria.stopping_tolerance >= 0.0 {
            common.stopping_tolerance = criteria.stopping_tolerance;
        }
    }
}
