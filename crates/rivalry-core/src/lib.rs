//! Core domain model for job orchestration and cached competitive analyses.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

mod error;
mod normalize;

pub use error::OrchestrationError;
pub use normalize::{coerce_metric, normalize, Metric, METRIC_FIELDS, UNKNOWN_SENTINEL};

pub const CRATE_NAME: &str = "rivalry-core";

/// Kinds of work this layer can hand to the external job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobName {
    Scrape,
    FullAnalysis,
    CustomAnalysis,
}

impl JobName {
    pub const ALL: [JobName; 3] = [JobName::Scrape, JobName::FullAnalysis, JobName::CustomAnalysis];

    pub fn as_str(self) -> &'static str {
        match self {
            JobName::Scrape => "scrape",
            JobName::FullAnalysis => "fullAnalysis",
            JobName::CustomAnalysis => "customAnalysis",
        }
    }

    /// Event name the runner dispatches on.
    pub fn runner_event_name(self) -> &'static str {
        match self {
            JobName::Scrape => "scrape/all-brands",
            JobName::FullAnalysis => "analysis/full",
            JobName::CustomAnalysis => "analysis/custom",
        }
    }

    /// Step count assumed when the runner reports no step list.
    pub fn default_total_steps(self) -> u32 {
        match self {
            JobName::Scrape => 8,
            JobName::FullAnalysis => 6,
            JobName::CustomAnalysis => 4,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobName {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s.trim()) || name.runner_event_name() == s.trim())
            .ok_or_else(|| OrchestrationError::InvalidRequest(format!("unknown job name `{s}`")))
    }
}

/// Append-only ledger row written when a job is first triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub job_name: JobName,
    pub metadata: serde_json::Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Canonical job state derived from whatever vocabulary the runner speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Case-insensitive mapping of a runner status word. Unrecognized words are `Queued`.
    pub fn from_external(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => JobStatus::Queued,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" | "CANCELLED" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub percentage: u8,
    pub current_step_name: Option<String>,
    pub completed_steps: u32,
    pub total_steps: u32,
}

impl Progress {
    pub fn from_counts(completed_steps: u32, total_steps: u32, current_step_name: Option<String>) -> Self {
        Self {
            percentage: percentage(completed_steps, total_steps),
            current_step_name,
            completed_steps,
            total_steps,
        }
    }
}

/// `round(100 * completed / total)` clamped to `[0, 100]`; zero when `total == 0`.
pub fn percentage(completed_steps: u32, total_steps: u32) -> u8 {
    if total_steps == 0 {
        return 0;
    }
    let ratio = 100.0 * f64::from(completed_steps) / f64::from(total_steps);
    ratio.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonKind {
    Full,
    Custom,
}

impl ComparisonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComparisonKind::Full => "full",
            ComparisonKind::Custom => "custom",
        }
    }

    pub fn job_name(self) -> JobName {
        match self {
            ComparisonKind::Full => JobName::FullAnalysis,
            ComparisonKind::Custom => JobName::CustomAnalysis,
        }
    }
}

impl fmt::Display for ComparisonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComparisonKind {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ComparisonKind::Full),
            "custom" => Ok(ComparisonKind::Custom),
            other => Err(OrchestrationError::InvalidRequest(format!(
                "unknown comparison kind `{other}`"
            ))),
        }
    }
}

/// Cache lookup key. `Full` covers every known brand; `Custom` is an unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestFingerprint {
    Full,
    Custom(BTreeSet<String>),
}

impl RequestFingerprint {
    /// Validates the brand list for `kind` and builds the lookup key.
    pub fn new(kind: ComparisonKind, brands: &[String]) -> Result<Self, OrchestrationError> {
        match kind {
            ComparisonKind::Full => Ok(RequestFingerprint::Full),
            ComparisonKind::Custom => {
                let [a, b] = brands else {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "custom comparison needs exactly two brands, got {}",
                        brands.len()
                    )));
                };
                let (a, b) = (a.trim(), b.trim());
                if a.is_empty() || b.is_empty() {
                    return Err(OrchestrationError::InvalidRequest(
                        "brand identifiers must not be empty".to_string(),
                    ));
                }
                if a.eq_ignore_ascii_case(b) {
                    return Err(OrchestrationError::InvalidRequest(format!(
                        "custom comparison needs two distinct brands, got `{a}` twice"
                    )));
                }
                Ok(RequestFingerprint::Custom(
                    [a.to_string(), b.to_string()].into_iter().collect(),
                ))
            }
        }
    }

    pub fn kind(&self) -> ComparisonKind {
        match self {
            RequestFingerprint::Full => ComparisonKind::Full,
            RequestFingerprint::Custom(_) => ComparisonKind::Custom,
        }
    }

    /// Whether a stored analysis answers this fingerprint.
    pub fn matches(&self, kind: ComparisonKind, brands: &[String]) -> bool {
        match self {
            RequestFingerprint::Full => kind == ComparisonKind::Full,
            RequestFingerprint::Custom(pair) => {
                kind == ComparisonKind::Custom
                    && brands.len() == pair.len()
                    && brands.iter().all(|b| pair.contains(b.trim()))
            }
        }
    }
}

/// Product line as it appears inside an analysis document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: Metric,
    #[serde(default)]
    pub monthly_cost: Metric,
    #[serde(default)]
    pub upfront_cost: Metric,
    #[serde(default)]
    pub value_score: Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandScore {
    pub brand: String,
    #[serde(default)]
    pub score: Metric,
    #[serde(default)]
    pub average_monthly_cost: Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMatch {
    pub home_product: ProductSnapshot,
    pub rival_product: ProductSnapshot,
    #[serde(default)]
    pub price_difference: Metric,
    #[serde(default)]
    pub score: Metric,
    #[serde(default)]
    pub verdict: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub brand_scores: Vec<BrandScore>,
    #[serde(default)]
    pub products: Vec<ProductSnapshot>,
    #[serde(default)]
    pub insights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomAnalysis {
    pub home_brand: String,
    pub rival_brand: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub product_matches: Vec<ProductMatch>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Analysis document, discriminated by comparison kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "comparisonKind", rename_all = "lowercase")]
pub enum AnalysisPayload {
    Full(FullAnalysis),
    Custom(CustomAnalysis),
}

impl AnalysisPayload {
    /// Normalizes an untyped document and validates it against `kind`.
    pub fn from_document(kind: ComparisonKind, document: JsonValue) -> Result<Self, OrchestrationError> {
        let mut document = normalize(document);
        let Some(object) = document.as_object_mut() else {
            return Err(OrchestrationError::Internal(
                "analysis document is not a JSON object".to_string(),
            ));
        };
        let tag = object
            .get("comparisonKind")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);
        if let Some(tag) = tag.filter(|tag| !tag.eq_ignore_ascii_case(kind.as_str())) {
            return Err(OrchestrationError::Internal(format!(
                "analysis document tagged `{tag}` where `{kind}` was expected"
            )));
        }
        object.insert("comparisonKind".to_string(), JsonValue::from(kind.as_str()));
        serde_json::from_value(document)
            .map_err(|err| OrchestrationError::Internal(format!("malformed {kind} analysis: {err}")))
    }

    pub fn kind(&self) -> ComparisonKind {
        match self {
            AnalysisPayload::Full(_) => ComparisonKind::Full,
            AnalysisPayload::Custom(_) => ComparisonKind::Custom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: Uuid,
    pub comparison_kind: ComparisonKind,
    pub brands: Vec<String>,
    pub payload: AnalysisPayload,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(brands: Vec<String>, payload: AnalysisPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            comparison_kind: payload.kind(),
            brands,
            payload,
            created_at,
        }
    }

    /// The brand whose products are analyzed against the rest.
    pub fn home_brand(&self) -> Option<&str> {
        self.brands.first().map(String::as_str)
    }
}

/// Most recent collected source data for one brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub brand: String,
    pub collected_at: DateTime<Utc>,
    pub data: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_mapping_is_total_and_case_insensitive() {
        let cases = [
            ("QUEUED", JobStatus::Queued),
            ("running", JobStatus::Running),
            ("Completed", JobStatus::Completed),
            ("FAILED", JobStatus::Failed),
            ("cancelled", JobStatus::Failed),
            ("UNKNOWN_X", JobStatus::Queued),
            ("", JobStatus::Queued),
        ];
        for (raw, expected) in cases {
            assert_eq!(JobStatus::from_external(raw), expected, "{raw}");
        }
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn percentage_stays_in_bounds() {
        for total in 0..=20u32 {
            for completed in 0..=total {
                let p = percentage(completed, total);
                assert!(p <= 100);
                if total == 0 {
                    assert_eq!(p, 0);
                }
            }
        }
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(8, 8), 100);
        assert_eq!(percentage(9, 8), 100);
    }

    #[test]
    fn custom_fingerprint_requires_two_distinct_brands() {
        let ok = RequestFingerprint::new(ComparisonKind::Custom, &["O2".into(), " Vodafone ".into()])
            .expect("valid pair");
        assert!(ok.matches(ComparisonKind::Custom, &["Vodafone".into(), "O2".into()]));
        assert!(!ok.matches(ComparisonKind::Full, &[]));

        for brands in [
            vec!["O2".to_string()],
            vec!["O2".to_string(), "o2".to_string()],
            vec!["O2".to_string(), "  ".to_string()],
            vec!["O2".to_string(), "EE".to_string(), "Three".to_string()],
        ] {
            let err = RequestFingerprint::new(ComparisonKind::Custom, &brands).unwrap_err();
            assert_eq!(err.code(), "INVALID_REQUEST");
        }
    }

    #[test]
    fn job_names_parse_from_ledger_and_runner_names() {
        assert_eq!("customAnalysis".parse::<JobName>().unwrap(), JobName::CustomAnalysis);
        assert_eq!("analysis/full".parse::<JobName>().unwrap(), JobName::FullAnalysis);
        assert_eq!(JobName::Scrape.default_total_steps(), 8);
        assert!("bogus".parse::<JobName>().is_err());
    }

    #[test]
    fn payload_is_tagged_by_comparison_kind() {
        let payload = AnalysisPayload::from_document(
            ComparisonKind::Custom,
            json!({
                "homeBrand": "O2",
                "rivalBrand": "Vodafone",
                "productMatches": [{
                    "homeProduct": {"name": "SIM 30GB", "price": "£12.50"},
                    "rivalProduct": {"name": "Red 25GB", "price": null},
                    "score": 7
                }]
            }),
        )
        .expect("custom payload");

        let AnalysisPayload::Custom(custom) = &payload else {
            panic!("expected custom payload");
        };
        let first = &custom.product_matches[0];
        assert_eq!(first.home_product.price, Metric::Known(12.5));
        assert_eq!(first.rival_product.price, Metric::Unknown);
        assert_eq!(first.price_difference, Metric::Unknown);

        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["comparisonKind"], "custom");
        assert_eq!(encoded["productMatches"][0]["rivalProduct"]["price"], UNKNOWN_SENTINEL);
    }

    #[test]
    fn payload_with_wrong_tag_is_rejected() {
        let err = AnalysisPayload::from_document(
            ComparisonKind::Full,
            json!({"comparisonKind": "custom", "homeBrand": "O2", "rivalBrand": "EE"}),
        )
        .unwrap_err();
        assert_eq!(err.code(), "INTERNAL_SERVER_ERROR");
    }
}
