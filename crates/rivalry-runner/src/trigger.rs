use std::sync::Arc;

use chrono::{DateTime, Utc};
use rivalry_core::{JobName, OrchestrationError};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

use crate::{JobRunner, RunnerError};

/// Kind-specific job payload handed to the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Scrape,
    FullAnalysis,
    CustomAnalysis { brand_a: String, brand_b: String },
}

impl JobPayload {
    pub fn job_name(&self) -> JobName {
        match self {
            JobPayload::Scrape => JobName::Scrape,
            JobPayload::FullAnalysis => JobName::FullAnalysis,
            JobPayload::CustomAnalysis { .. } => JobName::CustomAnalysis,
        }
    }

    /// Fields describing the request, without provenance stamps.
    pub fn metadata(&self) -> Map<String, JsonValue> {
        let mut map = Map::new();
        if let JobPayload::CustomAnalysis { brand_a, brand_b } = self {
            map.insert("brandA".to_string(), json!(brand_a));
            map.insert("brandB".to_string(), json!(brand_b));
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredJob {
    pub job_id: String,
    pub job_name: JobName,
    /// Request fields, suitable for the event ledger.
    pub metadata: Map<String, JsonValue>,
    pub submitted_at: DateTime<Utc>,
}

/// Submits jobs to the runner, stamping provenance into every payload.
#[derive(Clone)]
pub struct JobTrigger {
    runner: Arc<dyn JobRunner>,
    triggered_by: String,
}

impl JobTrigger {
    pub fn new(runner: Arc<dyn JobRunner>, triggered_by: impl Into<String>) -> Self {
        Self {
            runner,
            triggered_by: triggered_by.into(),
        }
    }

    pub fn triggered_by(&self) -> &str {
        &self.triggered_by
    }

    /// Returns the first id the runner assigned. Not retried on failure.
    pub async fn trigger(&self, payload: JobPayload) -> Result<TriggeredJob, OrchestrationError> {
        let job_name = payload.job_name();
        let submitted_at = Utc::now();
        let metadata = payload.metadata();

        let mut data = metadata.clone();
        data.insert("triggeredBy".to_string(), json!(self.triggered_by));
        data.insert("submittedAt".to_string(), json!(submitted_at.to_rfc3339()));
        let data = JsonValue::Object(data);

        let ids = self
            .runner
            .submit(job_name.runner_event_name(), &data)
            .await
            .map_err(|err| submission_error(job_name, err))?;

        let mut ids = ids.into_iter();
        let Some(job_id) = ids.next() else {
            return Err(OrchestrationError::JobSubmission(format!(
                "runner accepted {} but reported no job id",
                job_name.runner_event_name()
            )));
        };
        let untracked = ids.collect::<Vec<_>>();
        if !untracked.is_empty() {
            warn!(%job_id, ?untracked, "runner fanned out into several runs; tracking only the first");
        }
        info!(%job_id, job_name = %job_name, "job submitted");

        Ok(TriggeredJob {
            job_id,
            job_name,
            metadata,
            submitted_at,
        })
    }
}

fn submission_error(job_name: JobName, err: RunnerError) -> OrchestrationError {
    OrchestrationError::JobSubmission(format!(
        "submitting {}: {err}",
        job_name.runner_event_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryJobRunner;

    #[tokio::test]
    async fn custom_trigger_stamps_provenance_and_brand_pair() {
        let runner = Arc::new(MemoryJobRunner::new());
        let trigger = JobTrigger::new(runner.clone(), "unit-test");
        let job = trigger
            .trigger(JobPayload::CustomAnalysis {
                brand_a: "O2".into(),
                brand_b: "Vodafone".into(),
            })
            .await
            .unwrap();

        assert!(!job.job_id.is_empty());
        assert_eq!(job.metadata["brandA"], json!("O2"));
        assert!(job.metadata.get("triggeredBy").is_none());

        let sent = runner.submissions().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].name, "analysis/custom");
        assert_eq!(sent[0].data["triggeredBy"], json!("unit-test"));
        assert_eq!(sent[0].data["brandB"], json!("Vodafone"));
        assert!(sent[0].data["submittedAt"].is_string());
    }

    #[tokio::test]
    async fn only_first_of_several_ids_is_tracked() {
        let runner = Arc::new(MemoryJobRunner::new().with_ids_per_submission(3));
        let trigger = JobTrigger::new(runner.clone(), "unit-test");
        let job = trigger.trigger(JobPayload::Scrape).await.unwrap();
        let sent = runner.submissions().await;
        assert_eq!(job.job_id, sent[0].ids[0]);
        assert_eq!(sent[0].name, "scrape/all-brands");
    }

    #[tokio::test]
    async fn unreachable_runner_is_a_submission_error() {
        let runner = Arc::new(MemoryJobRunner::new());
        runner.reject_submissions(Some("connection refused".into())).await;
        let trigger = JobTrigger::new(runner, "unit-test");
        let err = trigger.trigger(JobPayload::FullAnalysis).await.unwrap_err();
        assert_eq!(err.code(), "JOB_SUBMISSION_FAILED");
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn empty_id_list_is_a_submission_error() {
        let runner = Arc::new(MemoryJobRunner::new().with_ids_per_submission(0));
        let trigger = JobTrigger::new(runner, "unit-test");
        let err = trigger.trigger(JobPayload::Scrape).await.unwrap_err();
        assert_eq!(err.code(), "JOB_SUBMISSION_FAILED");
    }
}
