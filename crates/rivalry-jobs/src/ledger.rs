use std::sync::Arc;

use chrono::Utc;
use rivalry_core::{JobName, JobRecord, OrchestrationError};
use rivalry_runner::TriggeredJob;
use rivalry_storage::{EventLedgerStore, DEFAULT_LEDGER_LIST_LIMIT};
use serde_json::{Map, Value as JsonValue};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_LEDGER_LIST_LIMIT: usize = 1_000;

/// Audit trail of triggered jobs. Writes are insert-or-ignore on the job id.
#[derive(Clone)]
pub struct EventLedger {
    store: Arc<dyn EventLedgerStore>,
}

impl EventLedger {
    pub fn new(store: Arc<dyn EventLedgerStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        job_id: &str,
        job_name: JobName,
        metadata: Map<String, JsonValue>,
    ) -> Result<JobRecord, OrchestrationError> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(OrchestrationError::InvalidRequest("job id must not be empty".to_string()));
        }
        self.store
            .insert_or_ignore(JobRecord {
                job_id: job_id.to_string(),
                job_name,
                metadata,
                created_at: Utc::now(),
            })
            .await
            .map_err(|err| OrchestrationError::internal(format!("recording job {job_id}: {err}")))
    }

    /// Records a job that the runner already accepted. Failures are logged, never returned.
    pub async fn record_best_effort(&self, job: &TriggeredJob) {
        match self.record(&job.job_id, job.job_name, job.metadata.clone()).await {
            Ok(_) => debug!(job_id = %job.job_id, "job recorded in ledger"),
            Err(err) => warn!(job_id = %job.job_id, error = %err, "ledger write failed; job continues unrecorded"),
        }
    }

    /// Same as [`record_best_effort`](Self::record_best_effort) on a spawned task.
    ///
    /// Only for long-lived processes; the write is lost if the runtime stops first.
    pub fn record_detached(&self, job: &TriggeredJob) -> JoinHandle<()> {
        let ledger = self.clone();
        let job = job.clone();
        tokio::spawn(async move { ledger.record_best_effort(&job).await })
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<JobRecord>, OrchestrationError> {
        self.store
            .find(job_id)
            .await
            .map_err(OrchestrationError::internal)
    }

    /// Newest first; `None` means the default page size.
    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<JobRecord>, OrchestrationError> {
        let limit = limit
            .unwrap_or(DEFAULT_LEDGER_LIST_LIMIT)
            .clamp(1, MAX_LEDGER_LIST_LIMIT);
        self.store
            .list_recent(limit)
            .await
            .map_err(OrchestrationError::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rivalry_storage::{MemoryStore, StoreError};
    use serde_json::json;

    struct BrokenLedger;

    #[async_trait]
    impl EventLedgerStore for BrokenLedger {
        async fn insert_or_ignore(&self, _record: JobRecord) -> Result<JobRecord, StoreError> {
            Err(StoreError::Decode("disk full".into()))
        }

        async fn find(&self, _job_id: &str) -> Result<Option<JobRecord>, StoreError> {
            Ok(None)
        }

        async fn list_recent(&self, _limit: usize) -> Result<Vec<JobRecord>, StoreError> {
            Ok(vec![])
        }
    }

    fn brands() -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("brandA".into(), json!("O2"));
        map.insert("brandB".into(), json!("Vodafone"));
        map
    }

    #[tokio::test]
    async fn recording_same_job_twice_keeps_one_row_without_error() {
        let store = Arc::new(MemoryStore::new());
        let ledger = EventLedger::new(store.clone());
        let first = ledger
            .record("job-42", JobName::CustomAnalysis, brands())
            .await
            .unwrap();
        let second = ledger
            .record("job-42", JobName::CustomAnalysis, Map::new())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.ledger_len().await, 1);
        assert_eq!(ledger.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_job_id_is_invalid() {
        let ledger = EventLedger::new(Arc::new(MemoryStore::new()));
        let err = ledger.record("  ", JobName::Scrape, Map::new()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn detached_write_failure_is_swallowed() {
        let ledger = EventLedger::new(Arc::new(BrokenLedger));
        let direct = ledger.record("job-1", JobName::Scrape, Map::new()).await;
        assert!(direct.is_err());

        let job = TriggeredJob {
            job_id: "job-1".into(),
            job_name: JobName::Scrape,
            metadata: Map::new(),
            submitted_at: Utc::now(),
        };
        ledger.record_best_effort(&job).await;
        ledger
            .record_detached(&job)
            .await
            .expect("detached task completes without panicking");
    }

    #[tokio::test]
    async fn best_effort_write_is_visible_once_awaited() {
        let store = Arc::new(MemoryStore::new());
        let ledger = EventLedger::new(store.clone());
        let job = TriggeredJob {
            job_id: "job-9".into(),
            job_name: JobName::Scrape,
            metadata: Map::new(),
            submitted_at: Utc::now(),
        };
        ledger.record_best_effort(&job).await;
        assert_eq!(ledger.find("job-9").await.unwrap().map(|r| r.job_name), Some(JobName::Scrape));
    }
}
