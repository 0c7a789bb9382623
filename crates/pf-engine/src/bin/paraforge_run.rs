//! Runs a training plan against the simulated runner and prints the summary
//! as JSON.
//!
//! Configuration comes from `PARAFORGE_RUN_CONFIG` (a JSON file) and
//! `PARAFORGE_PARALLELISM`; logging honors `RUST_LOG`.

use anyhow::{Context, Result};
use pf_engine::{RunConfig, SimulatedRunner, TrainingRun};
use pf_overlay::OverlayConfig;
use pf_types::DatasetHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::from_env().context("loading run configuration")?;
    let overlay = config
        .overlay(OverlayConfig::from_env())
        .context("building parameter overlay from algo_parameters")?;
    info!(
        parallelism = config.parallelism,
        steps = config.plan.len(),
        overrides = config.algo_parameters.len(),
        "configuration loaded"
    );

    let runner = SimulatedRunner::default()
        .with_delay(Duration::from_millis(200), Duration::from_millis(300))
        .with_failure_rate(0.1);
    let dataset = DatasetHandle::new("demo_train.hex", 50_000, 24);

    let summary = TrainingRun::new(Arc::new(runner), Arc::new(overlay), dataset, config)
        .execute()
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
