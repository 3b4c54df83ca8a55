//! Cron-driven repeated runs for `watch` mode and the optional in-server schedule.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{PawConfig, SyncPipeline};

/// Every tick performs a full `run_once`; a failed run is logged and the
/// schedule keeps going.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(result) => info!(run_id = %result.run_id, new = result.new_count, "scheduled run finished"),
                Err(err) => error!(error = %err, exit_code = err.exit_code(), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Scheduler for `PAW_SYNC_CRON`, only when `PAW_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(config: &PawConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let pipeline = SyncPipeline::from_config(config).context("building scheduled pipeline")?;
    build_scheduler(Arc::new(pipeline), &config.sync_cron).await.map(Some)
}
