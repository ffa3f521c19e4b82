use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rivalry_core::{AnalysisPayload, AnalysisResult, ComparisonKind, OrchestrationError, RequestFingerprint, SourceSnapshot};
use rivalry_storage::{AnalysisStore, SourceDataStore};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation quota exhausted: {0}")]
    RateLimited(String),
    #[error("generation failed: {0}")]
    Failed(String),
}

/// Produces an untyped analysis document from collected source data.
#[async_trait]
pub trait AnalysisGenerator: Send + Sync {
    async fn generate(
        &self,
        kind: ComparisonKind,
        brands: &[String],
        sources: &[SourceSnapshot],
    ) -> Result<JsonValue, GenerationError>;
}

/// Job-side counterpart of the cache gate: generates, validates and persists an analysis.
#[derive(Clone)]
pub struct AnalysisRecorder {
    generator: Arc<dyn AnalysisGenerator>,
    analyses: Arc<dyn AnalysisStore>,
    sources: Arc<dyn SourceDataStore>,
    source_lookback: Duration,
}

impl AnalysisRecorder {
    pub fn new(
        generator: Arc<dyn AnalysisGenerator>,
        analyses: Arc<dyn AnalysisStore>,
        sources: Arc<dyn SourceDataStore>,
        source_lookback: Duration,
    ) -> Self {
        Self {
            generator,
            analyses,
            sources,
            source_lookback,
        }
    }

    pub async fn generate_and_store(
        &self,
        kind: ComparisonKind,
        brands: &[String],
    ) -> Result<AnalysisResult, OrchestrationError> {
        RequestFingerprint::new(kind, brands)?;
        let brands = brands.iter().map(|b| b.trim().to_string()).collect::<Vec<_>>();
        let since = Utc::now() - self.source_lookback;
        let sources = self
            .sources
            .latest_snapshots(&brands, since)
            .await
            .map_err(OrchestrationError::internal)?;

        let document = self
            .generator
            .generate(kind, &brands, &sources)
            .await
            .map_err(|err| match err {
                GenerationError::RateLimited(reason) => {
                    warn!(%kind, %reason, "generation rate limited");
                    OrchestrationError::RateLimitExceeded(reason)
                }
                GenerationError::Failed(reason) => OrchestrationError::Internal(reason),
            })?;

        let payload = AnalysisPayload::from_document(kind, document)?;
        let result = AnalysisResult::new(brands, payload, Utc::now());
        self.analyses
            .insert_analysis(&result)
            .await
            .map_err(OrchestrationError::internal)?;
        info!(analysis_id = %result.id, %kind, "analysis stored");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivalry_core::Metric;
    use rivalry_storage::MemoryStore;
    use serde_json::json;

    struct Canned(Result<JsonValue, String>);

    #[async_trait]
    impl AnalysisGenerator for Canned {
        async fn generate(
            &self,
            _kind: ComparisonKind,
            _brands: &[String],
            _sources: &[SourceSnapshot],
        ) -> Result<JsonValue, GenerationError> {
            self.0.clone().map_err(GenerationError::RateLimited)
        }
    }

    fn recorder(output: Result<JsonValue, String>, store: Arc<MemoryStore>) -> AnalysisRecorder {
        AnalysisRecorder::new(Arc::new(Canned(output)), store.clone(), store, Duration::days(30))
    }

    #[tokio::test]
    async fn generated_document_is_normalized_and_stored() {
        let store = Arc::new(MemoryStore::new());
        let document = json!({
            "homeBrand": "O2",
            "rivalBrand": "Vodafone",
            "summary": "O2 cheaper on SIM-only",
            "productMatches": [{
                "homeProduct": {"name": "O2 Unlimited", "monthlyCost": "£30"},
                "rivalProduct": {"name": "Vodafone Max", "monthlyCost": null},
                "priceDifference": "n/a"
            }]
        });
        let result = recorder(Ok(document), store.clone())
            .generate_and_store(ComparisonKind::Custom, &["O2".into(), "Vodafone".into()])
            .await
            .unwrap();

        let AnalysisPayload::Custom(custom) = &result.payload else {
            panic!("expected custom payload");
        };
        let matched = &custom.product_matches[0];
        assert_eq!(matched.home_product.monthly_cost, Metric::Known(30.0));
        assert_eq!(matched.rival_product.monthly_cost, Metric::Unknown);
        assert_eq!(matched.price_difference, Metric::Unknown);
        assert_eq!(store.analyses_len().await, 1);
    }

    #[tokio::test]
    async fn quota_errors_become_rate_limit_exceeded() {
        let store = Arc::new(MemoryStore::new());
        let err = recorder(Err("daily quota".into()), store.clone())
            .generate_and_store(ComparisonKind::Full, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(store.analyses_len().await, 0);
    }

    #[tokio::test]
    async fn mismatched_document_tag_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = recorder(Ok(json!({"comparisonKind": "custom", "homeBrand": "O2", "rivalBrand": "EE"})), store.clone())
            .generate_and_store(ComparisonKind::Full, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL_SERVER_ERROR");
        assert_eq!(store.analyses_len().await, 0);
    }
}
