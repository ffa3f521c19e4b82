//! Dedup gate in front of analysis generation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rivalry_core::{
    AnalysisPayload, AnalysisResult, ComparisonKind, JobName, OrchestrationError, RequestFingerprint,
};
use rivalry_runner::{JobPayload, JobTrigger};
use rivalry_storage::{AnalysisStore, SourceDataStore};
use serde_json::to_value;
use tracing::{debug, info, info_span, Instrument};

use crate::ledger::EventLedger;

#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    /// How old a stored analysis may be and still count as a hit.
    pub freshness: Duration,
    /// How far back source snapshots are considered.
    pub source_lookback: Duration,
    /// Registry brands covered by a full comparison. Empty means every brand with data.
    pub known_brands: Vec<String>,
}

impl CachePolicy {
    pub fn from_days(freshness_days: i64, source_lookback_days: i64, known_brands: Vec<String>) -> Self {
        Self {
            freshness: Duration::days(freshness_days),
            source_lookback: Duration::days(source_lookback_days),
            known_brands,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_days(30, 30, Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome {
    Hit(AnalysisResult),
    Miss { job_id: String, job_name: JobName },
}

/// When the ledger row for a triggered job is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerWrite {
    Detached,
    Awaited,
}

#[derive(Clone)]
pub struct ResultCache {
    analyses: Arc<dyn AnalysisStore>,
    sources: Arc<dyn SourceDataStore>,
    trigger: JobTrigger,
    ledger: EventLedger,
    policy: CachePolicy,
}

impl ResultCache {
    pub fn new(
        analyses: Arc<dyn AnalysisStore>,
        sources: Arc<dyn SourceDataStore>,
        trigger: JobTrigger,
        ledger: EventLedger,
        policy: CachePolicy,
    ) -> Self {
        Self {
            analyses,
            sources,
            trigger,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Returns a fresh stored analysis, or triggers generation and returns the job id.
    ///
    /// Source data is checked before anything is triggered. The lookup and the
    /// trigger are not atomic: two concurrent misses both trigger.
    pub async fn get_or_trigger(
        &self,
        kind: ComparisonKind,
        brands: &[String],
    ) -> Result<CacheOutcome, OrchestrationError> {
        let span = info_span!("get_or_trigger", kind = %kind, brands = ?brands);
        self.lookup_then_trigger(kind, brands, LedgerWrite::Detached)
            .instrument(span)
            .await
    }

    /// Like [`get_or_trigger`](Self::get_or_trigger), but a miss returns only after
    /// the ledger write settles. Short-lived processes use this before shutting down.
    pub async fn get_or_trigger_recorded(
        &self,
        kind: ComparisonKind,
        brands: &[String],
    ) -> Result<CacheOutcome, OrchestrationError> {
        let span = info_span!("get_or_trigger", kind = %kind, brands = ?brands);
        self.lookup_then_trigger(kind, brands, LedgerWrite::Awaited)
            .instrument(span)
            .await
    }

    async fn lookup_then_trigger(
        &self,
        kind: ComparisonKind,
        brands: &[String],
        ledger_write: LedgerWrite,
    ) -> Result<CacheOutcome, OrchestrationError> {
        let fingerprint = RequestFingerprint::new(kind, brands)?;
        let requested = match kind {
            ComparisonKind::Full => self.full_brand_set().await?,
            ComparisonKind::Custom => brands.iter().map(|b| b.trim().to_string()).collect(),
        };
        self.ensure_source_data(kind, &requested).await?;

        let since = Utc::now() - self.policy.freshness;
        let cached = self
            .analyses
            .latest_analysis(&fingerprint, since)
            .await
            .map_err(OrchestrationError::internal)?;
        if let Some(mut analysis) = cached {
            analysis.payload = renormalize(analysis.payload)?;
            info!(analysis_id = %analysis.id, "cache hit");
            return Ok(CacheOutcome::Hit(analysis));
        }

        let payload = match kind {
            ComparisonKind::Full => JobPayload::FullAnalysis,
            ComparisonKind::Custom => JobPayload::CustomAnalysis {
                brand_a: requested[0].clone(),
                brand_b: requested[1].clone(),
            },
        };
        let job = self.trigger.trigger(payload).await?;
        match ledger_write {
            LedgerWrite::Detached => {
                self.ledger.record_detached(&job);
            }
            LedgerWrite::Awaited => self.ledger.record_best_effort(&job).await,
        }
        info!(job_id = %job.job_id, "cache miss; generation triggered");
        Ok(CacheOutcome::Miss {
            job_id: job.job_id,
            job_name: job.job_name,
        })
    }

    async fn full_brand_set(&self) -> Result<Vec<String>, OrchestrationError> {
        if !self.policy.known_brands.is_empty() {
            return Ok(self.policy.known_brands.clone());
        }
        let since = Utc::now() - self.policy.source_lookback;
        let brands = self
            .sources
            .brands_with_data(since)
            .await
            .map_err(OrchestrationError::internal)?;
        if brands.is_empty() {
            return Err(OrchestrationError::NoDataFound { brands: Vec::new() });
        }
        Ok(brands)
    }

    async fn ensure_source_data(&self, kind: ComparisonKind, brands: &[String]) -> Result<(), OrchestrationError> {
        let since = Utc::now() - self.policy.source_lookback;
        let snapshots = self
            .sources
            .latest_snapshots(brands, since)
            .await
            .map_err(OrchestrationError::internal)?;
        let missing = brands
            .iter()
            .filter(|brand| !snapshots.iter().any(|s| &s.brand == *brand))
            .cloned()
            .collect::<Vec<_>>();
        debug!(found = snapshots.len(), missing = missing.len(), "source data checked");

        match (kind, missing.first()) {
            (_, None) => Ok(()),
            (ComparisonKind::Full, Some(_)) => Err(OrchestrationError::NoDataFound { brands: missing }),
            (ComparisonKind::Custom, Some(brand)) => Err(OrchestrationError::IncompleteData {
                brand: brand.clone(),
            }),
        }
    }
}

/// Runs a stored payload back through the normalizer before it leaves the gate.
fn renormalize(payload: AnalysisPayload) -> Result<AnalysisPayload, OrchestrationError> {
    let kind = payload.kind();
    let document = to_value(&payload).map_err(OrchestrationError::internal)?;
    AnalysisPayload::from_document(kind, document)
}
