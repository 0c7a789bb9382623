//! # pf-engine
//!
//! Parallel model-build dispatcher and budgeted training runs.
//!
//! The [`Dispatcher`] runs submitted jobs concurrently on the tokio runtime,
//! hands every terminal result to a feeder callback, and resolves a
//! one-shot completion barrier once the feeder has declared that no more
//! jobs will come and every submitted job has been delivered.
//! [`TrainingRun`] drives a plan of algorithm steps through a dispatcher
//! under the limits of a [`StoppingCriteria`].

pub mod budget;
pub mod dispatcher;
pub mod job;
pub mod run;
pub mod runner;

pub use budget::{BuildControl, StopReason, StoppingCriteria, AUTO_STOPPING_TOLERANCE};
pub use dispatcher::{DispatchStats, Dispatcher, Feeder, RunningJob};
pub use job::{Job, JobFailure, JobId, JobResult, JobSuccess};
pub use run::{AlgoParameterOverride, PlanStep, RunConfig, RunSummary, TrainedModel, TrainingRun};
pub use runner::{ScoredArtifact, SimulatedModel, SimulatedRunner, TrainingRunner};
