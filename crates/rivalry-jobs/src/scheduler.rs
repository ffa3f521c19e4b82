use anyhow::{Context, Result};
use rivalry_runner::{JobPayload, JobTrigger};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::JobsConfig;
use crate::ledger::EventLedger;

/// Builds the periodic scrape scheduler, or `None` when scheduling is disabled.
///
/// The caller starts and shuts down the returned scheduler.
pub async fn maybe_build_scrape_scheduler(
    config: &JobsConfig,
    trigger: JobTrigger,
    ledger: EventLedger,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scrape_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let trigger = trigger.clone();
        let ledger = ledger.clone();
        Box::pin(async move {
            match trigger.trigger(JobPayload::Scrape).await {
                Ok(job) => {
                    info!(job_id = %job.job_id, "scheduled scrape triggered");
                    ledger.record_detached(&job);
                }
                Err(err) => warn!(error = %err, "scheduled scrape could not be submitted"),
            }
        })
    })
    .with_context(|| format!("creating scrape job for cron {cron}"))?;
    sched.add(job).await.context("adding scrape job")?;
    Ok(Some(sched))
}
