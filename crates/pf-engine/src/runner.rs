//! Training-runner abstraction and a simulated implementation.

use async_trait::async_trait;
use pf_types::{Algo, StoppingMetric, TrainingError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::job::Job;

/// Produces a trained artifact from a job.
///
/// Called many times concurrently; implementations must not share mutable
/// state between invocations.
#[async_trait]
pub trait TrainingRunner: Send + Sync + 'static {
    type Artifact: Send + 'static;

    async fn train(&self, job: &Job) -> Result<Self::Artifact, TrainingError>;
}

/// Artifacts that can report a score for early stopping.
pub trait ScoredArtifact {
    fn score(&self, metric: StoppingMetric) -> Option<f64>;
}

/// Stand-in model produced by [`SimulatedRunner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedModel {
    pub model_id: String,
    pub algo: Algo,
    pub score: f64,
}

impl ScoredArtifact for SimulatedModel {
    fn score(&self, _metric: StoppingMetric) -> Option<f64> {
        Some(self.score)
    }
}

/// Runner that sleeps instead of training. Used by the demo binary and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedRunner {
    pub base_delay: Duration,
    pub jitter: Duration,
    /// Probability in `[0, 1]` that any job fails.
    pub failure_rate: f64,
    /// Algorithms whose jobs always fail.
    pub failing_algos: Vec<Algo>,
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            jitter: Duration::from_millis(50),
            failure_rate: 0.0,
            failing_algos: Vec::new(),
        }
    }
}

impl SimulatedRunner {
    pub fn with_delay(mut self, base_delay: Duration, jitter: Duration) -> Self {
        self.base_delay = base_delay;
        self.jitter = jitter;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate;
        self
    }

    /// `failure_rate` as a valid probability; NaN counts as never failing.
    fn failure_probability(&self) -> f64 {
        if self.failure_rate.is_nan() {
            0.0
        } else {
            self.failure_rate.clamp(0.0, 1.0)
        }
    }

    pub fn failing(mut self, algo: Algo) -> Self {
        self.failing_algos.push(algo);
        self
    }
}

#[async_trait]
impl TrainingRunner for SimulatedRunner {
    type Artifact = SimulatedModel;

    async fn train(&self, job: &Job) -> Result<SimulatedModel, TrainingError> {
        let (delay, unlucky) = {
            let mut rng = rand::rng();
            let jitter = self.jitter.mul_f64(rng.random::<f64>());
            (self.base_delay + jitter, rng.random_bool(self.failure_probability()))
        };

        if let Some(limit) = job.max_runtime {
            if delay > limit {
                tokio::time::sleep(limit).await;
                return Err(TrainingError::Timeout {
                    seconds: limit.as_secs_f64(),
                });
            }
        }

        tokio::time::sleep(delay).await;
        let algo = job.algo();
        debug!(job_id = %job.id, %algo, ?delay, "simulated training finished");

        if self.failing_algos.contains(&algo) || unlucky {
            return Err(TrainingError::Failed {
                message: format!("simulated failure for {algo} on {}", job.dataset.key),
            });
        }

        let score = rand::rng().random_range(0.5..1.0);
        Ok(SimulatedModel {
            model_id: format!("{algo}_{}", job.id),
            algo,
            score,
        })
    }
}
