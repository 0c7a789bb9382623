//! Units of work and their terminal outcomes.

use chrono::{DateTime, Utc};
use pf_types::{Algo, AlgoParameters, DatasetHandle, TrainingError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One training attempt: an algorithm, its resolved parameters and a dataset.
///
/// A job is submitted once and ends in exactly one [`JobResult`]. Retrying
/// means creating a new job (see [`JobFailure::retry`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub parameters: AlgoParameters,
    pub dataset: DatasetHandle,
    /// Wall-clock ceiling the runner is expected to honor.
    pub max_runtime: Option<Duration>,
    /// 1 for the first attempt at a configuration.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(parameters: AlgoParameters, dataset: DatasetHandle) -> Self {
        Self {
            id: JobId::new(),
            parameters,
            dataset,
            max_runtime: None,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_runtime(mut self, max_runtime: Option<Duration>) -> Self {
        self.max_runtime = max_runtime;
        if let Some(limit) = max_runtime {
            self.parameters.common_mut().max_runtime_secs = limit.as_secs_f64();
        }
        self
    }

    pub fn algo(&self) -> Algo {
        self.parameters.algo()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSuccess<A> {
    pub job_id: JobId,
    pub algo: Algo,
    pub artifact: A,
    pub elapsed: Duration,
}

/// Why a job failed and exactly which parameters it ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub algo: Algo,
    pub cause: TrainingError,
    pub parameters: AlgoParameters,
    pub attempt: u32,
    pub elapsed: Duration,
}

impl JobFailure {
    /// A fresh job with the exact parameters that failed, one attempt later.
    pub fn retry(&self, dataset: DatasetHandle, max_runtime: Option<Duration>) -> Job {
        Job {
            attempt: self.attempt + 1,
            ..Job::new(self.parameters.clone(), dataset)
        }
        .with_max_runtime(max_runtime)
    }
}

/// Terminal outcome of a job, delivered once to the feeder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobResult<A> {
    Success(JobSuccess<A>),
    Failure(JobFailure),
}

impl<A> JobResult<A> {
    pub fn job_id(&self) -> JobId {
        match self {
            JobResult::Success(s) => s.job_id,
            JobResult::Failure(f) => f.job_id,
        }
    }

    pub fn algo(&self) -> Algo {
        match self {
            JobResult::Success(s) => s.algo,
            JobResult::Failure(f) => f.algo,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_is_a_new_job() {
        let dataset = DatasetHandle::new("train.hex", 100, 4);
        let mut parameters = AlgoParameters::defaults(Algo::Gbm);
        parameters.set_field("ntrees", &serde_json::json!(300)).unwrap();
        let job = Job::new(parameters, dataset.clone())
            .with_max_runtime(Some(Duration::from_secs(30)));
        assert_eq!(job.parameters.common().max_runtime_secs, 30.0);

        let failure = JobFailure {
            job_id: job.id,
            algo: job.algo(),
            cause: TrainingError::Timeout { seconds: 30.0 },
            parameters: job.parameters.clone(),
            attempt: job.attempt,
            elapsed: Duration::from_secs(30),
        };
        let retry = failure.retry(dataset, Some(Duration::from_secs(12)));
        assert_ne!(retry.id, job.id);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.max_runtime, Some(Duration::from_secs(12)));
        assert_eq!(retry.parameters.common().max_runtime_secs, 12.0);
        assert_eq!(retry.parameters.get_field("ntrees"), job.parameters.get_field("ntrees"));
        assert_eq!(retry.dataset, job.dataset);
        assert_eq!(retry.algo(), Algo::Gbm);
    }

    #[test]
    fn result_accessors() {
        let id = JobId::new();
        let failure: JobResult<()> = JobResult::Failure(JobFailure {
            job_id: id,
            algo: Algo::Glm,
            cause: TrainingError::Failed {
                message: "singular matrix".to_string(),
            },
            parameters: AlgoParameters::defaults(Algo::Glm),
            attempt: 1,
            elapsed: Duration::from_millis(5),
        });
        assert_eq!(failure.job_id(), id);
        assert_eq!(failure.algo(), Algo::Glm);
        assert!(!failure.is_success());
    }
}
