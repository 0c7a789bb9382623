//! Budgeted training runs on top of the dispatcher.
//!
//! A [`TrainingRun`] walks a plan of algorithm steps, keeps at most
//! `parallelism` jobs outstanding, retries failures within a run-wide cap,
//! and stops submitting once a [`StoppingCriteria`] limit is hit. All
//! follow-up decisions happen inside the feeder, so the dispatcher barrier
//! only resolves once the run has nothing left to do.

use parking_lot::Mutex;
use pf_overlay::{OverlayConfig, ParameterOverlay};
use pf_types::{validation_error, Algo, AlgoParameters, DatasetHandle, PfResult, ProblemType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::budget::{BuildControl, StopReason, StoppingCriteria};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::job::{Job, JobFailure, JobId, JobResult};
use crate::runner::{ScoredArtifact, TrainingRunner};

/// Environment variable naming a JSON run configuration file.
pub const RUN_CONFIG_ENV: &str = "PARAFORGE_RUN_CONFIG";
/// Environment variable overriding [`RunConfig::parallelism`].
pub const PARALLELISM_ENV: &str = "PARAFORGE_PARALLELISM";

/// One model configuration to train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub algo: Algo,
    /// Field overrides on top of the algorithm defaults.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl PlanStep {
    pub fn new(algo: Algo) -> Self {
        Self {
            algo,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// One `algo_parameters` entry: applies to every algorithm when `algo` is
/// absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoParameterOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo: Option<Algo>,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of jobs outstanding at once.
    pub parallelism: usize,
    /// Total retries allowed across the whole run.
    pub max_retries: u32,
    pub problem_type: ProblemType,
    pub build_control: BuildControl,
    pub plan: Vec<PlanStep>,
    /// Overrides fed through the parameter overlay.
    pub algo_parameters: Vec<AlgoParameterOverride>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            max_retries: 2,
            problem_type: ProblemType::Classification,
            build_control: BuildControl::default(),
            plan: default_plan(),
            algo_parameters: Vec::new(),
        }
    }
}

fn default_plan() -> Vec<PlanStep> {
    vec![
        PlanStep::new(Algo::XGBoost),
        PlanStep::new(Algo::Glm),
        PlanStep::new(Algo::Drf),
        PlanStep::new(Algo::Gbm),
        PlanStep::new(Algo::DeepLearning),
        PlanStep::new(Algo::Gbm)
            .with_param("max_depth", 8)
            .with_param("learn_rate", 0.05),
        PlanStep::new(Algo::XGBoost).with_param("max_depth", 10),
    ]
}

impl RunConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> PfResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from [`RUN_CONFIG_ENV`] when set, otherwise use defaults, then
    /// apply [`PARALLELISM_ENV`].
    pub fn from_env() -> PfResult<Self> {
        let config = match std::env::var(RUN_CONFIG_ENV) {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        config.with_parallelism_override(std::env::var(PARALLELISM_ENV).ok().as_deref())
    }

    fn with_parallelism_override(mut self, raw: Option<&str>) -> PfResult<Self> {
        if let Some(raw) = raw {
            self.parallelism = raw
                .trim()
                .parse()
                .map_err(|_| validation_error!("{PARALLELISM_ENV} must be a positive integer, got {raw:?}"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Build the parameter overlay from `algo_parameters`, gated by `config`.
    pub fn overlay(&self, config: OverlayConfig) -> PfResult<ParameterOverlay> {
        let mut builder = ParameterOverlay::builder(config);
        for entry in &self.algo_parameters {
            match entry.algo {
                Some(algo) => builder.add_for(algo, entry.name.as_str(), entry.value.clone())?,
                None => builder.add(entry.name.as_str(), entry.value.clone())?,
            };
        }
        Ok(builder.build()?)
    }

    pub fn validate(&self) -> PfResult<()> {
        if self.parallelism == 0 {
            return Err(validation_error!("parallelism must be at least 1"));
        }
        Ok(())
    }
}

/// A successfully trained model and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel<A> {
    pub job_id: JobId,
    pub algo: Algo,
    pub artifact: A,
    pub score: Option<f64>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary<A> {
    pub project: String,
    pub models: Vec<TrainedModel<A>>,
    /// Failures that were not retried.
    pub failures: Vec<JobFailure>,
    /// Set when a budget limit cut the plan short.
    pub stop_reason: Option<StopReason>,
    pub retries: u32,
    pub elapsed: Duration,
    pub stats: DispatchStats,
}

/// Everything the feeder reads but never changes.
struct RunContext {
    steps: Vec<AlgoParameters>,
    dataset: DatasetHandle,
    criteria: StoppingCriteria,
    parallelism: usize,
    max_retries: u32,
    started: Instant,
}

struct RunState<A> {
    next_step: usize,
    outstanding: usize,
    retries: u32,
    stop_reason: Option<StopReason>,
    models: Vec<TrainedModel<A>>,
    failures: Vec<JobFailure>,
    scores: Vec<f64>,
}

impl<A> RunState<A> {
    fn new() -> Self {
        Self {
            next_step: 0,
            outstanding: 0,
            retries: 0,
            stop_reason: None,
            models: Vec::new(),
            failures: Vec::new(),
            scores: Vec::new(),
        }
    }
}

pub struct TrainingRun<R: TrainingRunner> {
    runner: Arc<R>,
    overlay: Arc<ParameterOverlay>,
    dataset: DatasetHandle,
    config: RunConfig,
}

impl<R> TrainingRun<R>
where
    R: TrainingRunner,
    R::Artifact: ScoredArtifact,
{
    pub fn new(
        runner: Arc<R>,
        overlay: Arc<ParameterOverlay>,
        dataset: DatasetHandle,
        config: RunConfig,
    ) -> Self {
        Self {
            runner,
            overlay,
            dataset,
            config,
        }
    }

    /// Resolve each plan step: defaults, build control, step overrides,
    /// then the overlay's custom parameters.
    fn resolve_steps(&self, control: &BuildControl) -> PfResult<Vec<AlgoParameters>> {
        self.config
            .plan
            .iter()
            .map(|step| {
                let mut params = AlgoParameters::defaults(step.algo);
                control.apply_to(&mut params);
                for (name, value) in &step.parameters {
                    let known = params
                        .set_field(name, value)
                        .map_err(|e| validation_error!("{} step: {e}", step.algo))?;
                    if !known {
                        return Err(validation_error!(
                            "{} has no parameter named {name}",
                            step.algo
                        ));
                    }
                }
                self.overlay.apply_custom_parameters(&mut params)?;
                Ok(params)
            })
            .collect()
    }

    pub async fn execute(self) -> PfResult<RunSummary<R::Artifact>> {
        self.config.validate()?;

        let mut control = self.config.build_control.clone();
        let project = control.project().to_string();
        let mut criteria = control.stopping_criteria.clone();
        criteria.resolve_tolerance(&self.dataset);
        criteria.stopping_metric = criteria.stopping_metric.resolve(self.config.problem_type);
        control.stopping_criteria = criteria.clone();

        let steps = self.resolve_steps(&control)?;
        info!(
            %project,
            dataset = %self.dataset,
            steps = steps.len(),
            parallelism = self.config.parallelism,
            "starting training run"
        );

        let ctx = Arc::new(RunContext {
            steps,
            dataset: self.dataset.clone(),
            criteria,
            parallelism: self.config.parallelism,
            max_retries: self.config.max_retries,
            started: Instant::now(),
        });
        let state = Arc::new(Mutex::new(RunState::new()));

        let dispatcher = {
            let ctx = Arc::clone(&ctx);
            let state = Arc::clone(&state);
            Dispatcher::new(Arc::clone(&self.runner), move |result, dispatcher| {
                on_result(&ctx, &state, result, dispatcher);
            })?
        };

        fill(&ctx, &state, &dispatcher);
        dispatcher.await_completion().await;

        let stats = dispatcher.stats();
        let mut state = state.lock();
        let summary = RunSummary {
            project,
            models: std::mem::take(&mut state.models),
            failures: std::mem::take(&mut state.failures),
            stop_reason: state.stop_reason,
            retries: state.retries,
            elapsed: ctx.started.elapsed(),
            stats,
        };
        info!(
            models = summary.models.len(),
            failures = summary.failures.len(),
            retries = summary.retries,
            stop_reason = ?summary.stop_reason,
            elapsed = ?summary.elapsed,
            "training run finished"
        );
        Ok(summary)
    }
}

fn on_result<R>(
    ctx: &RunContext,
    state: &Mutex<RunState<R::Artifact>>,
    result: JobResult<R::Artifact>,
    dispatcher: &Dispatcher<R>,
) where
    R: TrainingRunner,
    R::Artifact: ScoredArtifact,
{
    let retry = {
        let mut state = state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        match result {
            JobResult::Success(success) => {
                let score = success.artifact.score(ctx.criteria.stopping_metric);
                if let Some(score) = score {
                    state.scores.push(score);
                }
                state.models.push(TrainedModel {
                    job_id: success.job_id,
                    algo: success.algo,
                    artifact: success.artifact,
                    score,
                    elapsed: success.elapsed,
                });
                None
            }
            JobResult::Failure(failure) => {
                let elapsed = ctx.started.elapsed();
                let out_of_time = ctx
                    .criteria
                    .remaining(elapsed)
                    .is_some_and(|left| left.is_zero());
                if state.retries < ctx.max_retries && state.stop_reason.is_none() && !out_of_time {
                    state.retries += 1;
                    state.outstanding += 1;
                    debug!(
                        job_id = %failure.job_id,
                        algo = %failure.algo,
                        attempt = failure.attempt,
                        "retrying failed job"
                    );
                    Some(failure.retry(
                        ctx.dataset.clone(),
                        ctx.criteria.per_model_runtime(elapsed),
                    ))
                } else {
                    warn!(
                        job_id = %failure.job_id,
                        algo = %failure.algo,
                        cause = %failure.cause,
                        "job failed without retry"
                    );
                    state.failures.push(failure);
                    None
                }
            }
        }
    };

    if let Some(job) = retry {
        dispatcher.submit([job]);
    }
    fill(ctx, state, dispatcher);
}

/// Top up outstanding jobs to the parallelism limit, and close the
/// dispatcher once nothing is outstanding and nothing more will be submitted.
fn fill<R>(ctx: &RunContext, state: &Mutex<RunState<R::Artifact>>, dispatcher: &Dispatcher<R>)
where
    R: TrainingRunner,
{
    let (jobs, finished) = {
        let mut state = state.lock();
        let mut jobs = Vec::new();
        while state.stop_reason.is_none()
            && state.outstanding < ctx.parallelism
            && state.next_step < ctx.steps.len()
        {
            let elapsed = ctx.started.elapsed();
            if let Some(reason) = ctx
                .criteria
                .should_stop(elapsed, state.next_step, &state.scores)
            {
                info!(%reason, models_started = state.next_step, "budget exhausted");
                state.stop_reason = Some(reason);
                break;
            }
            let job = Job::new(ctx.steps[state.next_step].clone(), ctx.dataset.clone())
                .with_max_runtime(ctx.criteria.per_model_runtime(elapsed));
            state.next_step += 1;
            state.outstanding += 1;
            jobs.push(job);
        }
        let closed = state.stop_reason.is_some() || state.next_step >= ctx.steps.len();
        (jobs, closed && state.outstanding == 0)
    };

    dispatcher.submit(jobs);
    if finished {
        dispatcher.no_more_jobs();
    }
}
