use std::sync::Arc;

use chrono::{DateTime, Utc};
use rivalry_core::{JobName, JobStatus, OrchestrationError, Progress};
use rivalry_runner::{translate, ExecutionMode, JobRunner, RunnerError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::ledger::EventLedger;

const UNREACHABLE_NOTE: &str = "job runner unreachable; showing the job as running until it answers";

/// One-shot view of a job, shaped for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<JobName>,
    pub status: JobStatus,
    pub progress: Progress,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct JobStatusService {
    runner: Arc<dyn JobRunner>,
    ledger: EventLedger,
    mode: ExecutionMode,
}

impl JobStatusService {
    pub fn new(runner: Arc<dyn JobRunner>, ledger: EventLedger, mode: ExecutionMode) -> Self {
        Self { runner, ledger, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Fetches and translates the current state of `job_id`.
    ///
    /// The ledger only supplies the job kind for step defaults; a job the ledger
    /// never saw is still reported if the runner knows it.
    pub async fn current(&self, job_id: &str) -> Result<JobView, OrchestrationError> {
        let job_name = match self.ledger.find(job_id).await {
            Ok(record) => record.map(|r| r.job_name),
            Err(err) => {
                debug!(job_id, error = %err, "ledger lookup failed; using generic step defaults");
                None
            }
        };

        match self.runner.fetch_run(job_id).await {
            Ok(run) => {
                let translation = translate(&run, job_name);
                let error = (translation.status == JobStatus::Failed).then(|| run.failure_reason());
                Ok(JobView {
                    job_id: job_id.to_string(),
                    job_name,
                    status: translation.status,
                    progress: translation.progress,
                    started_at: run.started_at,
                    completed_at: run.ended_at,
                    result: run.output,
                    error,
                    note: None,
                })
            }
            Err(RunnerError::NotFound { .. }) => Err(OrchestrationError::JobNotFound {
                job_id: job_id.to_string(),
            }),
            Err(err) if err.is_transient() && self.mode == ExecutionMode::Local => {
                warn!(job_id, error = %err, "runner unreachable in local mode; reporting job as running");
                let total = job_name.map_or(1, JobName::default_total_steps);
                Ok(JobView {
                    job_id: job_id.to_string(),
                    job_name,
                    status: JobStatus::Running,
                    progress: Progress::from_counts(0, total, None),
                    started_at: None,
                    completed_at: None,
                    result: None,
                    error: None,
                    note: Some(UNREACHABLE_NOTE.to_string()),
                })
            }
            Err(err) => Err(OrchestrationError::internal(format!(
                "fetching status of job {job_id}: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivalry_runner::{MemoryJobRunner, RawRun, RawStep};
    use rivalry_storage::MemoryStore;
    use serde_json::{json, Map};

    async fn service(mode: ExecutionMode) -> (Arc<MemoryJobRunner>, JobStatusService) {
        let runner = Arc::new(MemoryJobRunner::new());
        let ledger = EventLedger::new(Arc::new(MemoryStore::new()));
        ledger
            .record("run-scrape", JobName::Scrape, Map::new())
            .await
            .unwrap();
        (runner.clone(), JobStatusService::new(runner, ledger, mode))
    }

    #[tokio::test]
    async fn running_job_reports_translated_progress() {
        let (runner, service) = service(ExecutionMode::Networked).await;
        let mut run = RawRun::with_status("RUNNING");
        run.steps = vec![
            RawStep { name: "collect".into(), status: "COMPLETED".into() },
            RawStep { name: "compare".into(), status: "RUNNING".into() },
        ];
        runner.script("run-1", vec![Ok(run)]).await;

        let view = service.current("run-1").await.unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.progress.percentage, 50);
        assert_eq!(view.progress.current_step_name.as_deref(), Some("compare"));
        assert!(view.note.is_none());
    }

    #[tokio::test]
    async fn ledger_kind_drives_step_defaults() {
        let (runner, service) = service(ExecutionMode::Networked).await;
        runner
            .script("run-scrape", vec![Ok(RawRun::with_status("queued"))])
            .await;
        let view = service.current("run-scrape").await.unwrap();
        assert_eq!(view.job_name, Some(JobName::Scrape));
        assert_eq!(view.progress.total_steps, 8);
    }

    #[tokio::test]
    async fn failed_job_carries_reason() {
        let (runner, service) = service(ExecutionMode::Networked).await;
        let mut run = RawRun::with_status("FAILED");
        run.error = Some(json!({"message": "scraper blocked"}));
        runner.script("run-2", vec![Ok(run)]).await;
        let view = service.current("run-2").await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("scraper blocked"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (_, service) = service(ExecutionMode::Local).await;
        let err = service.current("ghost").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn unreachable_runner_degrades_only_in_local_mode() {
        let (runner, local) = service(ExecutionMode::Local).await;
        runner
            .script("run-scrape", vec![Err(RunnerError::Unreachable("refused".into()))])
            .await;
        let view = local.current("run-scrape").await.unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert!(view.note.is_some());

        let (runner, networked) = service(ExecutionMode::Networked).await;
        runner
            .script("run-scrape", vec![Err(RunnerError::Unreachable("refused".into()))])
            .await;
        let err = networked.current("run-scrape").await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL_SERVER_ERROR");
    }
}
